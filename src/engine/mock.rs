//! In-memory connection and recording consumer for engine tests.
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use crate::{
    CompletionBridge, Connection, Consumer, QueryEngine, QueryError, QueryHandle, RowStatus,
    SlotIndex,
};

/// How submitted queries complete.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Mode {
    /// Only when the test calls [`MockBackend::reply`].
    Manual,
    /// Synchronously, inside `begin`/`restart`, using the next scripted reply.
    Immediate,
    /// From a helper thread after the delay, using the next scripted reply.
    Delayed(Duration),
}

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Rows(u32),
    Fail(QueryError),
}

#[derive(Debug, Default)]
struct QueryState {
    bridge: Option<CompletionBridge>,
    rows: VecDeque<u32>,
    outcome: Option<Result<(), QueryError>>,
    running: bool,
    submissions: usize,
    closed: bool,
}

struct BackendState {
    mode: Mode,
    queries: Vec<Arc<Mutex<QueryState>>>,
    script: VecDeque<Reply>,
    open_failures: VecDeque<QueryError>,
    keyspaces: Vec<Option<String>>,
}

#[derive(Clone)]
pub(crate) struct MockBackend {
    inner: Arc<Mutex<BackendState>>,
}

impl MockBackend {
    pub fn new(mode: Mode) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BackendState {
                mode,
                queries: Vec::new(),
                script: VecDeque::new(),
                open_failures: VecDeque::new(),
                keyspaces: Vec::new(),
            })),
        }
    }

    pub fn connection(&self) -> MockConnection {
        MockConnection {
            backend: self.clone(),
        }
    }

    /// Replies handed out, in order, to automatically completing submissions.
    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.inner.lock().unwrap().script.extend(replies);
    }

    pub fn fail_next_open(&self, error: QueryError) {
        self.inner.lock().unwrap().open_failures.push_back(error);
    }

    /// Completes query number `query` (in opening order) and signals its bridge.
    pub fn reply(&self, query: usize, reply: Reply) {
        let state = Arc::clone(&self.inner.lock().unwrap().queries[query]);
        apply(&state, reply);
    }

    pub fn opened(&self) -> usize {
        self.inner.lock().unwrap().queries.len()
    }

    pub fn submissions(&self, query: usize) -> usize {
        self.query(query).lock().unwrap().submissions
    }

    pub fn is_closed(&self, query: usize) -> bool {
        self.query(query).lock().unwrap().closed
    }

    pub fn keyspaces(&self) -> Vec<Option<String>> {
        self.inner.lock().unwrap().keyspaces.clone()
    }

    fn query(&self, query: usize) -> Arc<Mutex<QueryState>> {
        Arc::clone(&self.inner.lock().unwrap().queries[query])
    }

    fn next_reply(&self) -> (Mode, Reply) {
        let mut inner = self.inner.lock().unwrap();
        let reply = inner.script.pop_front().unwrap_or(Reply::Rows(1));
        (inner.mode, reply)
    }
}

fn apply(state: &Arc<Mutex<QueryState>>, reply: Reply) {
    let bridge = {
        let mut state = state.lock().unwrap();
        if state.closed {
            return;
        }
        match reply {
            Reply::Rows(count) => {
                state.rows.extend(0..count);
                state.outcome = Some(Ok(()));
            }
            Reply::Fail(err) => state.outcome = Some(Err(err)),
        }
        state.running = false;
        state.bridge.clone()
    };

    if let Some(bridge) = bridge {
        bridge.notify();
    }
}

pub(crate) struct MockConnection {
    backend: MockBackend,
}

impl Connection for MockConnection {
    type Query = MockQuery;

    fn new_query(&mut self, keyspace: Option<&str>) -> Result<MockQuery, QueryError> {
        let mut inner = self.backend.inner.lock().unwrap();
        inner.keyspaces.push(keyspace.map(String::from));
        if let Some(err) = inner.open_failures.pop_front() {
            return Err(err);
        }

        let state = Arc::new(Mutex::new(QueryState::default()));
        inner.queries.push(Arc::clone(&state));
        Ok(MockQuery {
            id: inner.queries.len() - 1,
            state,
            backend: self.backend.clone(),
            row: None,
        })
    }
}

pub(crate) struct MockQuery {
    id: usize,
    state: Arc<Mutex<QueryState>>,
    backend: MockBackend,
    row: Option<u32>,
}

impl MockQuery {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn row(&self) -> Option<u32> {
        self.row
    }

    /// Submits the query to the fake backend.
    pub fn begin(&mut self) {
        {
            let mut state = self.state.lock().unwrap();
            state.running = true;
            state.submissions += 1;
            state.rows.clear();
            state.outcome = None;
        }

        let (mode, reply) = match self.backend.next_reply() {
            (Mode::Manual, _) => return,
            next => next,
        };
        match mode {
            Mode::Immediate => apply(&self.state, reply),
            Mode::Delayed(delay) => {
                let state = Arc::clone(&self.state);
                thread::spawn(move || {
                    thread::sleep(delay);
                    apply(&state, reply);
                });
            }
            Mode::Manual => {}
        }
    }

    fn is_settled(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.rows.is_empty() || state.outcome.is_some()
    }
}

impl QueryHandle for MockQuery {
    fn set_completion_callback(&mut self, bridge: CompletionBridge) {
        self.state.lock().unwrap().bridge = Some(bridge);
    }

    fn is_active(&self) -> bool {
        self.state.lock().unwrap().running
    }

    fn next_row(&mut self) -> Result<RowStatus, QueryError> {
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.rows.pop_front() {
            self.row = Some(row);
            return Ok(RowStatus::DataReady);
        }
        match state.outcome.take() {
            None => Ok(RowStatus::Wait),
            Some(Ok(())) => {
                state.outcome = Some(Ok(()));
                Ok(RowStatus::Done)
            }
            Some(Err(err)) => Err(err),
        }
    }

    fn wait(&mut self, timeout: Duration) -> Result<RowStatus, QueryError> {
        let deadline = Instant::now() + timeout;
        while !self.is_settled() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        self.next_row()
    }

    fn restart(&mut self) -> Result<(), QueryError> {
        self.begin();
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.bridge = None;
    }

    fn describe(&self) -> String {
        format!("mock#{}", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Start(&'static str, SlotIndex),
    Row(&'static str, u32),
    Reset(&'static str),
    Finish(&'static str),
    Failed(&'static str, QueryError),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Events(Arc<Mutex<Vec<Event>>>);

impl Events {
    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn all(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|e| matches(e)).count()
    }

    pub fn starts(&self) -> Vec<&'static str> {
        self.all()
            .into_iter()
            .filter_map(|event| match event {
                Event::Start(name, _) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn finished(&self, name: &str) -> usize {
        self.count(|event| matches!(event, Event::Finish(n) if *n == name))
    }

    pub fn failed(&self, name: &str) -> usize {
        self.count(|event| matches!(event, Event::Failed(n, _) if *n == name))
    }

    pub fn resets(&self, name: &str) -> usize {
        self.count(|event| matches!(event, Event::Reset(n) if *n == name))
    }
}

type Hook = Box<dyn FnMut(&mut QueryEngine<MockConnection>) + Send>;

/// Consumer that records every callback it receives.
pub(crate) struct Probe {
    name: &'static str,
    events: Events,
    decline: bool,
    pause: bool,
    follow_ups: usize,
    on_start: Option<Hook>,
    on_row: Option<Hook>,
}

impl Probe {
    pub fn new(name: &'static str, events: &Events) -> Self {
        Self {
            name,
            events: events.clone(),
            decline: false,
            pause: false,
            follow_ups: 0,
            on_start: None,
            on_row: None,
        }
    }

    pub fn declining(mut self) -> Self {
        self.decline = true;
        self
    }

    /// Asks the engine to stop pulling rows after every row.
    pub fn pausing(mut self) -> Self {
        self.pause = true;
        self
    }

    /// Keeps the slot for `count` extra statements after the first one finishes.
    pub fn with_follow_ups(mut self, count: usize) -> Self {
        self.follow_ups = count;
        self
    }

    pub fn on_start(
        mut self,
        hook: impl FnMut(&mut QueryEngine<MockConnection>) + Send + 'static,
    ) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }

    pub fn on_row(
        mut self,
        hook: impl FnMut(&mut QueryEngine<MockConnection>) + Send + 'static,
    ) -> Self {
        self.on_row = Some(Box::new(hook));
        self
    }

    pub fn boxed(self) -> Box<dyn Consumer<MockConnection>> {
        Box::new(self)
    }
}

impl Consumer<MockConnection> for Probe {
    fn start(
        &mut self,
        query: &mut MockQuery,
        engine: &mut QueryEngine<MockConnection>,
        slot: SlotIndex,
    ) -> bool {
        self.events.push(Event::Start(self.name, slot));
        if let Some(hook) = self.on_start.as_mut() {
            hook(engine);
        }
        if self.decline {
            return false;
        }
        query.begin();
        true
    }

    fn process_row(
        &mut self,
        query: &mut MockQuery,
        engine: &mut QueryEngine<MockConnection>,
        _slot: SlotIndex,
    ) -> bool {
        self.events
            .push(Event::Row(self.name, query.row().unwrap_or_default()));
        if let Some(hook) = self.on_row.as_mut() {
            hook(engine);
        }
        !self.pause
    }

    fn reset(
        &mut self,
        _query: &mut MockQuery,
        _engine: &mut QueryEngine<MockConnection>,
        _slot: SlotIndex,
    ) {
        self.events.push(Event::Reset(self.name));
    }

    fn finish(
        &mut self,
        query: &mut MockQuery,
        _engine: &mut QueryEngine<MockConnection>,
        _slot: SlotIndex,
    ) -> bool {
        self.events.push(Event::Finish(self.name));
        if self.follow_ups == 0 {
            return true;
        }
        self.follow_ups -= 1;
        query.begin();
        false
    }

    fn failed(
        &mut self,
        _query: Option<&mut MockQuery>,
        _engine: &mut QueryEngine<MockConnection>,
        _slot: Option<SlotIndex>,
        error: &QueryError,
    ) {
        self.events.push(Event::Failed(self.name, error.clone()));
    }
}
