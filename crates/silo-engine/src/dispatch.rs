//! Typed request/response messages and their dispatch.
//!
//! Each request carries an operation tag; a worker thread dispatches it to
//! the handler for that operation, which calls the storage collaborator,
//! fills the matched response type, sets the result code, and hands the
//! response to the transport sink. The request is consumed by dispatch.

use std::fmt;
use std::sync::Arc;

use silo_error::{ErrorCode, Result, SiloError};
use silo_types::{EditOptions, ErrorDesc, MoveDirection, SessionId, Value};
use tracing::{debug, warn};

use crate::pool::RpSession;
use crate::store::{GetItemsOpts, SchemaInfo, ValueEntry};

/// The operation tag shared by requests and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListSchemas,
    GetItem,
    GetItems,
    SetItem,
    DeleteItem,
    MoveItem,
    Validate,
    Commit,
    DiscardChanges,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ListSchemas => "list-schemas",
            Self::GetItem => "get-item",
            Self::GetItems => "get-items",
            Self::SetItem => "set-item",
            Self::DeleteItem => "delete-item",
            Self::MoveItem => "move-item",
            Self::Validate => "validate",
            Self::Commit => "commit",
            Self::DiscardChanges => "discard-changes",
        };
        f.write_str(label)
    }
}

/// A client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ListSchemas,
    GetItem {
        path: String,
    },
    GetItems {
        path: String,
        opts: Option<GetItemsOpts>,
    },
    SetItem {
        path: String,
        value: Option<Value>,
        opts: EditOptions,
    },
    DeleteItem {
        path: String,
        opts: EditOptions,
    },
    MoveItem {
        path: String,
        direction: MoveDirection,
    },
    Validate,
    Commit,
    DiscardChanges,
}

impl Request {
    /// The operation tag of this request.
    #[must_use]
    pub const fn operation(&self) -> Operation {
        match self {
            Self::ListSchemas => Operation::ListSchemas,
            Self::GetItem { .. } => Operation::GetItem,
            Self::GetItems { .. } => Operation::GetItems,
            Self::SetItem { .. } => Operation::SetItem,
            Self::DeleteItem { .. } => Operation::DeleteItem,
            Self::MoveItem { .. } => Operation::MoveItem,
            Self::Validate => Operation::Validate,
            Self::Commit => Operation::Commit,
            Self::DiscardChanges => Operation::DiscardChanges,
        }
    }
}

/// A response, one matched type per operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    ListSchemas {
        result: ErrorCode,
        schemas: Vec<SchemaInfo>,
    },
    GetItem {
        result: ErrorCode,
        value: Option<Value>,
    },
    GetItems {
        result: ErrorCode,
        values: Vec<ValueEntry>,
    },
    SetItem {
        result: ErrorCode,
    },
    DeleteItem {
        result: ErrorCode,
    },
    MoveItem {
        result: ErrorCode,
    },
    Validate {
        result: ErrorCode,
        errors: Vec<ErrorDesc>,
    },
    Commit {
        result: ErrorCode,
        errors: Vec<ErrorDesc>,
    },
    DiscardChanges {
        result: ErrorCode,
    },
}

impl Response {
    /// The top-level result code.
    #[must_use]
    pub const fn result(&self) -> ErrorCode {
        match self {
            Self::ListSchemas { result, .. }
            | Self::GetItem { result, .. }
            | Self::GetItems { result, .. }
            | Self::SetItem { result }
            | Self::DeleteItem { result }
            | Self::MoveItem { result }
            | Self::Validate { result, .. }
            | Self::Commit { result, .. }
            | Self::DiscardChanges { result } => *result,
        }
    }

    /// The operation tag of this response.
    #[must_use]
    pub const fn operation(&self) -> Operation {
        match self {
            Self::ListSchemas { .. } => Operation::ListSchemas,
            Self::GetItem { .. } => Operation::GetItem,
            Self::GetItems { .. } => Operation::GetItems,
            Self::SetItem { .. } => Operation::SetItem,
            Self::DeleteItem { .. } => Operation::DeleteItem,
            Self::MoveItem { .. } => Operation::MoveItem,
            Self::Validate { .. } => Operation::Validate,
            Self::Commit { .. } => Operation::Commit,
            Self::DiscardChanges { .. } => Operation::DiscardChanges,
        }
    }
}

/// One message submitted to the request processor.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    /// A client request to service.
    Request(Request),
    /// A response; the engine produces these and never accepts them.
    Response(Response),
}

/// One message handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutMsg {
    /// The session the response belongs to.
    pub session_id: SessionId,
    /// The response payload.
    pub response: Response,
}

/// The message-send primitive of the transport surface.
pub trait ResponseSink: Send + Sync {
    /// Hand one response to the transport.
    fn send(&self, msg: OutMsg) -> Result<()>;
}

/// Dispatch one message for `session`, producing exactly one response for a
/// request. Responses received where requests are expected are dropped as
/// unsupported.
pub(crate) fn dispatch(sink: &dyn ResponseSink, session: &Arc<RpSession>, msg: Msg) {
    let request = match msg {
        Msg::Request(request) => request,
        Msg::Response(response) => {
            warn!(
                session = %session.id(),
                operation = %response.operation(),
                "unsupported response message received"
            );
            return;
        }
    };

    let operation = request.operation();
    debug!(session = %session.id(), %operation, "processing request");

    let response = {
        let mut store = session.store_session();
        match request {
            Request::ListSchemas => match store.list_schemas() {
                Ok(schemas) => Response::ListSchemas {
                    result: ErrorCode::Ok,
                    schemas,
                },
                Err(e) => Response::ListSchemas {
                    result: e.error_code(),
                    schemas: Vec::new(),
                },
            },
            Request::GetItem { path } => match store.get_item(&path) {
                Ok(value) => Response::GetItem {
                    result: ErrorCode::Ok,
                    value: Some(value),
                },
                Err(e) => {
                    debug!(session = %session.id(), path = %path, error = %e, "get-item failed");
                    Response::GetItem {
                        result: e.error_code(),
                        value: None,
                    }
                }
            },
            Request::GetItems { path, opts } => match store.get_items(&path, opts.as_ref()) {
                Ok(values) => Response::GetItems {
                    result: ErrorCode::Ok,
                    values,
                },
                Err(e) => {
                    debug!(session = %session.id(), path = %path, error = %e, "get-items failed");
                    Response::GetItems {
                        result: e.error_code(),
                        values: Vec::new(),
                    }
                }
            },
            Request::SetItem { path, value, opts } => {
                let result = match store.set_item(&path, value.as_ref(), opts) {
                    Ok(()) => ErrorCode::Ok,
                    Err(e) => {
                        warn!(session = %session.id(), path = %path, error = %e, "set-item failed");
                        e.error_code()
                    }
                };
                Response::SetItem { result }
            }
            Request::DeleteItem { path, opts } => {
                let result = match store.delete_item(&path, opts) {
                    Ok(()) => ErrorCode::Ok,
                    Err(e) => {
                        warn!(session = %session.id(), path = %path, error = %e, "delete-item failed");
                        e.error_code()
                    }
                };
                Response::DeleteItem { result }
            }
            Request::MoveItem { path, direction } => {
                let result = match store.move_item(&path, direction) {
                    Ok(()) => ErrorCode::Ok,
                    Err(e) => {
                        warn!(session = %session.id(), path = %path, error = %e, "move-item failed");
                        e.error_code()
                    }
                };
                Response::MoveItem { result }
            }
            Request::Validate => {
                let (result, errors) = edit_result(store.validate());
                Response::Validate { result, errors }
            }
            Request::Commit => {
                let (result, errors) = edit_result(store.commit());
                Response::Commit { result, errors }
            }
            Request::DiscardChanges => {
                let result = match store.discard_changes() {
                    Ok(()) => ErrorCode::Ok,
                    Err(e) => e.error_code(),
                };
                Response::DiscardChanges { result }
            }
        }
    };

    if let Err(e) = sink.send(OutMsg {
        session_id: session.id(),
        response,
    }) {
        warn!(session = %session.id(), %operation, error = %e, "response send failed");
    }
}

/// Result code plus attached error descriptors of a validate/commit call.
fn edit_result(res: Result<()>) -> (ErrorCode, Vec<ErrorDesc>) {
    match res {
        Ok(()) => (ErrorCode::Ok, Vec::new()),
        Err(SiloError::Validation { errors }) => (ErrorCode::Internal, errors),
        Err(e) => (e.error_code(), Vec::new()),
    }
}
