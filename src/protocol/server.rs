use std::{
    collections::{BTreeMap, HashMap},
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use log::{debug, info, warn};

use crate::Statement;

use super::{
    ProtocolTransport, Request, Response, ResponseError, Row, ThreadPool, TransportError,
};

const WORKERS: usize = 15;

type Keyspaces = HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

/// In-memory key/value server speaking the Cryo query protocol.
pub struct KeyspaceServer {
    listener: TcpListener,
    store: Arc<Mutex<Keyspaces>>,
    faults: Arc<FaultInjector>,
    pool: ThreadPool,
}

/// Answers every `every`-th query with [`ResponseError::Unavailable`].
#[derive(Debug, Default)]
struct FaultInjector {
    every: Option<usize>,
    seen: AtomicUsize,
}

impl FaultInjector {
    fn should_fail(&self) -> bool {
        let Some(every) = self.every.filter(|every| *every > 0) else {
            return false;
        };
        (self.seen.fetch_add(1, Ordering::SeqCst) + 1) % every == 0
    }
}

impl KeyspaceServer {
    pub fn bind(address: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(address)?,
            store: Arc::new(Mutex::new(HashMap::new())),
            faults: Arc::new(FaultInjector::default()),
            pool: ThreadPool::new(WORKERS)?,
        })
    }

    /// Makes every `every`-th query fail with a retryable error.
    pub fn with_fault_every(mut self, every: Option<usize>) -> Self {
        self.faults = Arc::new(FaultInjector {
            every,
            seen: AtomicUsize::new(0),
        });
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn listen(self) -> Result<(), TransportError> {
        info!("listening at {}", self.listener.local_addr()?);

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let store = Arc::clone(&self.store);
                    let faults = Arc::clone(&self.faults);
                    let queued = self.pool.execute(move || {
                        if let Err(e) = handle_connection(stream, store, faults) {
                            warn!("connection failed: {e}");
                        }
                    });
                    if !queued {
                        warn!("worker pool is shut down, dropping connection");
                    }
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        Ok(())
    }
}

fn handle_connection(
    stream: TcpStream,
    store: Arc<Mutex<Keyspaces>>,
    faults: Arc<FaultInjector>,
) -> Result<(), TransportError> {
    let mut transport = ProtocolTransport::new(stream);

    loop {
        let req = match transport.read_request() {
            Ok(req) => req,
            Err(e) if e.is_disconnect() => return Ok(()),
            Err(e) => return Err(e),
        };
        debug!("received request: {req:?}");

        let resp = match req {
            Request::CloseConnection => {
                transport.write_response(&Response::ConnectionClosed)?;
                return Ok(());
            }
            Request::Ping => Response::Pong,
            Request::Query { .. } if faults.should_fail() => Response::Err {
                code: ResponseError::Unavailable,
                description: "injected fault".to_string(),
            },
            Request::Query {
                keyspace,
                statement,
            } => match store.lock() {
                Ok(mut store) => run(&mut store, keyspace, statement),
                Err(_) => Response::Err {
                    code: ResponseError::Unavailable,
                    description: "store poisoned".to_string(),
                },
            },
        };

        transport.write_response(&resp)?;
    }
}

fn run(store: &mut Keyspaces, keyspace: String, statement: Statement) -> Response {
    let table = store.entry(keyspace).or_default();

    match statement {
        Statement::Get { key } => {
            let rows = table
                .get(&key)
                .map(|value| Row {
                    key,
                    value: value.clone(),
                })
                .into_iter()
                .collect();
            Response::Rows { rows }
        }
        Statement::Put { key, value } => {
            table.insert(key, value);
            Response::Ok
        }
        Statement::Delete { key } => {
            table.remove(&key);
            Response::Ok
        }
        Statement::Scan { prefix } => {
            let rows = table
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(key, value)| Row {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect();
            Response::Rows { rows }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement(s: &str) -> Statement {
        s.parse().unwrap()
    }

    #[test]
    fn keyspaces_are_isolated() {
        let mut store = Keyspaces::new();

        run(&mut store, "a".into(), statement("put k 1"));
        let resp = run(&mut store, "b".into(), statement("get k"));

        assert_eq!(resp, Response::Rows { rows: vec![] });
    }

    #[test]
    fn scan_returns_prefix_in_key_order() {
        let mut store = Keyspaces::new();
        for s in ["put user:2 bob", "put user:1 alice", "put zone:1 x"] {
            assert_eq!(run(&mut store, "ks".into(), statement(s)), Response::Ok);
        }

        let resp = run(&mut store, "ks".into(), statement("scan user:"));
        let Response::Rows { rows } = resp else {
            panic!("unexpected response: {resp:?}");
        };
        let keys = rows.into_iter().map(|row| row.key).collect::<Vec<_>>();
        assert_eq!(keys, vec![b"user:1".to_vec(), b"user:2".to_vec()]);
    }

    #[test]
    fn delete_removes_key() {
        let mut store = Keyspaces::new();

        run(&mut store, "ks".into(), statement("put k v"));
        run(&mut store, "ks".into(), statement("delete k"));

        assert_eq!(
            run(&mut store, "ks".into(), statement("get k")),
            Response::Rows { rows: vec![] }
        );
    }

    #[test]
    fn fault_injector_fails_every_nth_call() {
        let faults = FaultInjector {
            every: Some(3),
            seen: AtomicUsize::new(0),
        };

        let pattern = (0..6).map(|_| faults.should_fail()).collect::<Vec<_>>();
        assert_eq!(pattern, vec![false, false, true, false, false, true]);
        assert!(!FaultInjector::default().should_fail());
    }
}
