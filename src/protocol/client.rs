//! [`Connection`] implementation talking to a [`KeyspaceServer`](super::KeyspaceServer).
//!
//! Every submitted statement runs on its own short-lived I/O thread: connect, send the
//! request, read the response, close. The thread buffers the rows and notifies the slot's
//! [`CompletionBridge`]; the engine then reads them back through [`QueryHandle::next_row`].
use std::{
    collections::VecDeque,
    mem,
    net::{SocketAddr, TcpStream},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc::Sender},
    thread,
    time::Duration,
};

use log::{debug, trace};

use crate::{
    CompletionBridge, Connection, Consumer, QueryEngine, QueryError, QueryHandle, RowStatus,
    SlotIndex, Statement,
};

use super::{ProtocolTransport, Request, Response, Row};

pub const DEFAULT_KEYSPACE: &str = "default";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RemoteConnection {
    address: SocketAddr,
    timeout: Duration,
}

impl RemoteConnection {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bounds connecting, reading and writing for every query.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Checks that the server answers.
    pub fn ping(&self) -> Result<(), QueryError> {
        match round_trip(self.address, self.timeout, &Request::Ping)? {
            Response::Pong => Ok(()),
            other => Err(QueryError::Server(format!("unexpected response: {other:?}"))),
        }
    }
}

impl Connection for RemoteConnection {
    type Query = RemoteQuery;

    fn new_query(&mut self, keyspace: Option<&str>) -> Result<RemoteQuery, QueryError> {
        Ok(RemoteQuery {
            address: self.address,
            timeout: self.timeout,
            keyspace: keyspace.unwrap_or(DEFAULT_KEYSPACE).to_string(),
            statement: None,
            row: None,
            shared: Arc::new(Shared::default()),
        })
    }
}

#[derive(Debug, Default)]
enum ExchangeState {
    #[default]
    Idle,
    InFlight,
    Rows(VecDeque<Row>),
    Done,
    Failed(QueryError),
}

#[derive(Debug, Default)]
struct Exchange {
    /// Bumped on every submission so late results of an earlier run are dropped.
    generation: u64,
    bridge: Option<CompletionBridge>,
    state: ExchangeState,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    exchange: Mutex<Exchange>,
    settled: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Exchange> {
        self.exchange.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, generation: u64, result: Result<Vec<Row>, QueryError>) {
        let bridge = {
            let mut exchange = self.lock();
            if exchange.closed || exchange.generation != generation {
                trace!("discarding result of stale run {generation}");
                return;
            }
            exchange.state = match result {
                Ok(rows) => ExchangeState::Rows(rows.into()),
                Err(err) => ExchangeState::Failed(err),
            };
            exchange.bridge.clone()
        };

        self.settled.notify_all();
        if let Some(bridge) = bridge {
            bridge.notify();
        }
    }
}

pub struct RemoteQuery {
    address: SocketAddr,
    timeout: Duration,
    keyspace: String,
    statement: Option<Statement>,
    row: Option<Row>,
    shared: Arc<Shared>,
}

impl RemoteQuery {
    /// Runs `statement`, replacing whatever this handle ran before.
    pub fn submit(&mut self, statement: Statement) -> Result<(), QueryError> {
        self.statement = Some(statement);
        self.run()
    }

    /// Takes the row made available by the last [`RowStatus::DataReady`].
    pub fn take_row(&mut self) -> Option<Row> {
        self.row.take()
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    fn run(&mut self) -> Result<(), QueryError> {
        let Some(statement) = self.statement.clone() else {
            return Err(QueryError::Server("no statement submitted".to_string()));
        };

        let generation = {
            let mut exchange = self.shared.lock();
            if exchange.closed {
                return Err(QueryError::Cancelled("query handle closed".to_string()));
            }
            exchange.generation += 1;
            exchange.state = ExchangeState::InFlight;
            exchange.generation
        };
        self.row = None;

        let request = Request::query(self.keyspace.clone(), statement);
        let (address, timeout) = (self.address, self.timeout);
        let shared = Arc::clone(&self.shared);
        debug!("submitting {request:?} to {address}");

        thread::Builder::new()
            .name("cryopool-query".to_string())
            .spawn(move || shared.complete(generation, execute(address, timeout, &request)))
            .map_err(|e| QueryError::Transport(format!("failed to spawn query thread: {e}")))?;
        Ok(())
    }
}

impl QueryHandle for RemoteQuery {
    fn set_completion_callback(&mut self, bridge: CompletionBridge) {
        self.shared.lock().bridge = Some(bridge);
    }

    fn is_active(&self) -> bool {
        matches!(self.shared.lock().state, ExchangeState::InFlight)
    }

    fn next_row(&mut self) -> Result<RowStatus, QueryError> {
        let mut exchange = self.shared.lock();
        match &mut exchange.state {
            ExchangeState::Idle | ExchangeState::InFlight => Ok(RowStatus::Wait),
            ExchangeState::Rows(rows) => match rows.pop_front() {
                Some(row) => {
                    self.row = Some(row);
                    Ok(RowStatus::DataReady)
                }
                None => {
                    exchange.state = ExchangeState::Done;
                    Ok(RowStatus::Done)
                }
            },
            ExchangeState::Done => Ok(RowStatus::Done),
            ExchangeState::Failed(err) => Err(err.clone()),
        }
    }

    fn wait(&mut self, timeout: Duration) -> Result<RowStatus, QueryError> {
        let exchange = self.shared.lock();
        let (exchange, _) = self
            .shared
            .settled
            .wait_timeout_while(exchange, timeout, |exchange| {
                matches!(exchange.state, ExchangeState::InFlight)
            })
            .unwrap_or_else(PoisonError::into_inner);
        drop(exchange);
        self.next_row()
    }

    fn restart(&mut self) -> Result<(), QueryError> {
        self.run()
    }

    fn close(&mut self) {
        let mut exchange = self.shared.lock();
        exchange.closed = true;
        exchange.bridge = None;
        exchange.state = ExchangeState::Idle;
    }

    fn describe(&self) -> String {
        match &self.statement {
            Some(statement) => format!("{}: {statement}", self.keyspace),
            None => format!("{}: idle", self.keyspace),
        }
    }
}

fn round_trip(
    address: SocketAddr,
    timeout: Duration,
    request: &Request,
) -> Result<Response, QueryError> {
    let stream = TcpStream::connect_timeout(&address, timeout)
        .map_err(|e| QueryError::Unavailable(format!("{address}: {e}")))?;
    stream
        .set_read_timeout(Some(timeout))
        .and_then(|_| stream.set_write_timeout(Some(timeout)))
        .map_err(|e| QueryError::Transport(e.to_string()))?;

    let mut transport = ProtocolTransport::new(stream);
    transport.write_request(request)?;
    let resp = transport.read_response()?;

    if transport.write_request(&Request::CloseConnection).is_ok() {
        let _ = transport.read_response();
    }
    Ok(resp)
}

fn execute(
    address: SocketAddr,
    timeout: Duration,
    request: &Request,
) -> Result<Vec<Row>, QueryError> {
    match round_trip(address, timeout, request)? {
        Response::Rows { rows } => Ok(rows),
        Response::Ok => Ok(Vec::new()),
        Response::Err { code, description } => Err(code.into_query_error(description)),
        other => Err(QueryError::Server(format!("unexpected response: {other:?}"))),
    }
}

/// Result of one statement run through a [`Collector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutcome {
    pub statement: Statement,
    pub result: Result<Vec<Row>, QueryError>,
}

/// Consumer that runs a single statement and reports its rows over a channel.
pub struct Collector {
    statement: Statement,
    rows: Vec<Row>,
    outcomes: Sender<QueryOutcome>,
}

impl Collector {
    pub fn new(statement: Statement, outcomes: Sender<QueryOutcome>) -> Self {
        Self {
            statement,
            rows: Vec::new(),
            outcomes,
        }
    }

    fn report(&mut self, result: Result<Vec<Row>, QueryError>) {
        let outcome = QueryOutcome {
            statement: self.statement.clone(),
            result,
        };
        if self.outcomes.send(outcome).is_err() {
            debug!("outcome of '{}' dropped, receiver is gone", self.statement);
        }
    }
}

impl Consumer<RemoteConnection> for Collector {
    fn start(
        &mut self,
        query: &mut RemoteQuery,
        _engine: &mut QueryEngine<RemoteConnection>,
        _slot: SlotIndex,
    ) -> bool {
        match query.submit(self.statement.clone()) {
            Ok(()) => true,
            Err(err) => {
                self.report(Err(err));
                false
            }
        }
    }

    fn process_row(
        &mut self,
        query: &mut RemoteQuery,
        _engine: &mut QueryEngine<RemoteConnection>,
        _slot: SlotIndex,
    ) -> bool {
        self.rows.extend(query.take_row());
        true
    }

    fn reset(
        &mut self,
        _query: &mut RemoteQuery,
        _engine: &mut QueryEngine<RemoteConnection>,
        _slot: SlotIndex,
    ) {
        self.rows.clear();
    }

    fn finish(
        &mut self,
        _query: &mut RemoteQuery,
        _engine: &mut QueryEngine<RemoteConnection>,
        _slot: SlotIndex,
    ) -> bool {
        let rows = mem::take(&mut self.rows);
        self.report(Ok(rows));
        true
    }

    fn failed(
        &mut self,
        _query: Option<&mut RemoteQuery>,
        _engine: &mut QueryEngine<RemoteConnection>,
        _slot: Option<SlotIndex>,
        error: &QueryError,
    ) {
        self.report(Err(error.clone()));
    }
}
