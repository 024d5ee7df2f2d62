//! Method routing and the registry of open handles.
//!
//! Each handle sits behind its own mutex, so commands on one handle run one at
//! a time while distinct handles proceed independently. The registry lock is
//! only held long enough to look a handle up.

use crate::batch::{run_batch, BatchItem, BatchOptions};
use crate::command::{param, Command, CommandOptions, Envelope, Method, MethodCall, Params, Response};
use crate::config::{BridgeConfig, LogLevel};
use crate::cursor::CursorId;
use crate::database::{Database, DatabaseId, OpenOptions, IN_MEMORY_PATH};
use crate::error::{BridgeError, Result};
use crate::executor::{OperationKind, Outcome};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

type Handle = Arc<Mutex<Database>>;

struct Entry {
    path: String,
    handle: Handle,
}

#[derive(Default)]
struct Registry {
    next_id: DatabaseId,
    databases: HashMap<DatabaseId, Entry>,
    /// Resolved path -> id, for handles opened as single instance.
    single_instances: HashMap<String, DatabaseId>,
}

impl Registry {
    fn single_instance(&self, path: &str) -> Option<DatabaseId> {
        self.single_instances
            .get(path)
            .copied()
            .filter(|id| self.databases.contains_key(id))
    }
}

pub struct Dispatcher {
    config: BridgeConfig,
    log_level: RwLock<LogLevel>,
    registry: Mutex<Registry>,
}

impl Dispatcher {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            log_level: RwLock::new(config.log_level),
            config,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn log_level(&self) -> LogLevel {
        *self.log_level.read()
    }

    /// Handle one call and shape the outcome as an envelope.
    pub fn dispatch(&self, call: &MethodCall) -> Envelope {
        let result = self.handle(call);
        if let Err(err) = &result {
            if self.log_level().is_verbose() {
                debug!(method = %call.method, code = err.code(), error = %err, "call failed");
            }
        }
        Envelope::from_result(result)
    }

    pub fn handle(&self, call: &MethodCall) -> Result<Response> {
        let method: Method = call.method.parse()?;
        let params = Params::from_json(&call.arguments)?;

        match method {
            Method::Execute => self.run_params(OperationKind::Execute, &params),
            Method::Insert => self.run_params(OperationKind::Insert, &params),
            Method::Update => self.run_params(OperationKind::Update, &params),
            Method::Query => self.run_params(OperationKind::Query, &params),
            Method::OpenDatabase => {
                let mut options = OpenOptions::new(params.required_str(param::PATH)?)
                    .read_only(params.bool(param::READ_ONLY)?.unwrap_or(false))
                    .single_instance(params.bool(param::SINGLE_INSTANCE)?.unwrap_or(true));
                options.log_level = params.i64(param::LOG_LEVEL)?.map(parse_log_level).transpose()?;
                self.open_database(options)
            }
            Method::CloseDatabase => {
                self.close_database(params.database_id()?)?;
                Ok(Response::Done)
            }
            Method::DeleteDatabase => {
                self.delete_database(params.required_str(param::PATH)?)?;
                Ok(Response::Done)
            }
            Method::DatabaseExists => {
                let path = self.resolve_path(params.required_str(param::PATH)?);
                Ok(Response::Exists(path != IN_MEMORY_PATH && Path::new(&path).exists()))
            }
            Method::GetDatabasesPath => Ok(Response::Path(
                self.config
                    .databases_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
            )),
            Method::Options => {
                let level = parse_log_level(params.required_i64(param::LOG_LEVEL)?)?;
                self.set_log_level(level);
                Ok(Response::Done)
            }
            Method::QueryCursorNext => {
                let id = params.database_id()?;
                let cursor = params.required_i64(param::CURSOR_ID)?;
                if params.bool(param::CANCEL)?.unwrap_or(false) {
                    self.close_cursor(id, cursor)?;
                    Ok(Response::Done)
                } else {
                    self.next_page(id, cursor).map(Response::Page)
                }
            }
            Method::Batch => {
                let id = params.database_id()?;
                let items = BatchItem::parse_all(params.list(param::OPERATIONS)?)?;
                let options = CommandOptions::from_params(&params)?;
                self.batch(
                    id,
                    &items,
                    BatchOptions {
                        continue_on_error: options.continue_on_error,
                        no_result: options.no_result,
                        in_transaction: options.in_transaction_change.unwrap_or(false),
                    },
                )
            }
            Method::BeginTransaction => self.with_database(params.database_id()?, |db| {
                db.begin().map(|_| Response::Done)
            }),
            Method::CommitTransaction => self.with_database(params.database_id()?, |db| {
                db.commit().map(|_| Response::Done)
            }),
            Method::RollbackTransaction => self.with_database(params.database_id()?, |db| {
                db.rollback().map(|_| Response::Done)
            }),
        }
    }

    fn run_params(&self, kind: OperationKind, params: &Params) -> Result<Response> {
        let command = Command::from_params(kind, params)?;
        self.run(params.database_id()?, &command)
    }

    /// Run one statement on an open handle.
    pub fn run(&self, id: DatabaseId, command: &Command) -> Result<Response> {
        self.with_database(id, |db| match command.kind {
            OperationKind::Query => db.query(command).map(Response::Page),
            _ => Ok(match db.run(command)? {
                Outcome::Inserted(row_id) => Response::Inserted(row_id),
                Outcome::Updated(count) => Response::Updated(count),
                Outcome::Executed => Response::Done,
            }),
        })
    }

    pub fn batch(&self, id: DatabaseId, items: &[BatchItem], options: BatchOptions) -> Result<Response> {
        self.with_database(id, |db| run_batch(db, items, options).map(Response::Batch))
    }

    pub fn next_page(&self, id: DatabaseId, cursor: CursorId) -> Result<crate::cursor::Page> {
        self.with_database(id, |db| db.next_page(cursor))
    }

    pub fn close_cursor(&self, id: DatabaseId, cursor: CursorId) -> Result<()> {
        self.with_database(id, |db| {
            if db.close_cursor(cursor) {
                Ok(())
            } else {
                Err(BridgeError::InvalidCursor(cursor))
            }
        })
    }

    /// Open a handle. The registry lock is not held while the file opens, so
    /// a racing open of the same single-instance path is settled on insert.
    pub fn open_database(&self, mut options: OpenOptions) -> Result<Response> {
        options.path = self.resolve_path(&options.path);
        let shared = options.single_instance && !options.is_in_memory();

        let id = {
            let mut registry = self.registry.lock();
            if shared {
                if let Some(id) = registry.single_instance(&options.path) {
                    if self.log_level().is_verbose() {
                        debug!(db = id, path = %options.path, "reusing single instance");
                    }
                    return Ok(Response::Opened { id, recovered: true });
                }
            }
            registry.next_id += 1;
            registry.next_id
        };

        let config = BridgeConfig {
            log_level: self.log_level(),
            ..self.config.clone()
        };
        let database = Database::open(id, &options, &config)?;

        let mut registry = self.registry.lock();
        if shared {
            if let Some(existing) = registry.single_instance(&options.path) {
                drop(registry);
                database.close();
                return Ok(Response::Opened {
                    id: existing,
                    recovered: true,
                });
            }
            registry.single_instances.insert(options.path.clone(), id);
        }
        registry.databases.insert(
            id,
            Entry {
                path: options.path,
                handle: Arc::new(Mutex::new(database)),
            },
        );
        Ok(Response::Opened { id, recovered: false })
    }

    pub fn close_database(&self, id: DatabaseId) -> Result<()> {
        let handle = {
            let mut registry = self.registry.lock();
            let entry = registry
                .databases
                .remove(&id)
                .ok_or(BridgeError::DatabaseClosed(id))?;
            registry.single_instances.retain(|_, single| *single != id);
            entry.handle
        };
        close_handle(handle);
        Ok(())
    }

    /// Close every open handle.
    pub fn close_all(&self) {
        let handles: Vec<Handle> = {
            let mut registry = self.registry.lock();
            registry.single_instances.clear();
            registry.databases.drain().map(|(_, entry)| entry.handle).collect()
        };
        for handle in handles {
            close_handle(handle);
        }
    }

    /// Close handles on `path`, then remove the file and its journals.
    pub fn delete_database(&self, path: &str) -> Result<()> {
        let path = self.resolve_path(path);
        let open: Vec<DatabaseId> = self
            .registry
            .lock()
            .databases
            .iter()
            .filter(|(_, entry)| entry.path == path)
            .map(|(id, _)| *id)
            .collect();
        for id in open {
            self.close_database(id)?;
        }
        if path == IN_MEMORY_PATH {
            return Ok(());
        }
        for suffix in ["", "-journal", "-wal", "-shm"] {
            let file = format!("{path}{suffix}");
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(BridgeError::Io {
                        path: file,
                        message: e.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    pub fn set_log_level(&self, level: LogLevel) {
        *self.log_level.write() = level;
        let handles: Vec<Handle> = self
            .registry
            .lock()
            .databases
            .values()
            .map(|entry| Arc::clone(&entry.handle))
            .collect();
        for handle in handles {
            handle.lock().set_log_level(level);
        }
    }

    pub fn open_handles(&self) -> usize {
        self.registry.lock().databases.len()
    }

    /// Lock one handle, reclaim its idle cursors, then run `f` on it.
    pub fn with_database<T>(&self, id: DatabaseId, f: impl FnOnce(&mut Database) -> Result<T>) -> Result<T> {
        let handle = self
            .registry
            .lock()
            .databases
            .get(&id)
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or(BridgeError::DatabaseClosed(id))?;
        let mut db = handle.lock();
        if let Some(timeout) = self.config.cursor_idle_timeout() {
            db.reclaim_idle_cursors(timeout);
        }
        f(&mut *db)
    }

    fn resolve_path(&self, path: &str) -> String {
        if path == IN_MEMORY_PATH || Path::new(path).is_absolute() {
            return path.to_string();
        }
        match &self.config.databases_path {
            Some(base) => base.join(path).to_string_lossy().into_owned(),
            None => path.to_string(),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Close a handle already removed from the registry, waiting for any call
/// still running on it.
fn close_handle(mut handle: Handle) {
    loop {
        match Arc::try_unwrap(handle) {
            Ok(database) => return database.into_inner().close(),
            Err(shared) => {
                drop(shared.lock());
                std::thread::yield_now();
                handle = shared;
            }
        }
    }
}

fn parse_log_level(level: i64) -> Result<LogLevel> {
    LogLevel::try_from(level).map_err(BridgeError::BadParam)
}
