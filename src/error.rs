use thiserror::Error;

/// How a failed statement affects the connection that ran it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecErrorKind {
    /// Reported to the client, connection stays open.
    Normal,
    /// The storage engine could not serve the request; a fallback path may retry it.
    EngineUnavailable,
    /// A commit may or may not have happened. The connection must go away.
    ResultUndetermined,
    /// Server state is suspect. The connection must go away.
    Critical,
}

/// Coarse grouping used by the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Protocol,
    Auth,
    Timeout,
    Collation,
    Execution,
    Critical,
    Disconnect,
}

#[derive(Error, Debug)]
pub enum FrontendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("read timed out")]
    Timeout,

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("Got a packet bigger than 'max_allowed_packet' bytes")]
    PacketTooLarge,

    #[error("Connections using insecure transport are prohibited while --require_secure_transport=ON.")]
    SecureTransportRequired,

    #[error("Access denied for user '{user}'@'{host}' (using password: {})", yes_no(.using_password))]
    AccessDenied {
        user: String,
        host: String,
        using_password: bool,
    },

    #[error("Aborted connection {conn_id} to db: '{db}' user: '{user}' host: '{host}' ({reason})")]
    AbortingConnection {
        conn_id: u64,
        db: String,
        user: String,
        host: String,
        reason: String,
    },

    #[error("{message}")]
    IllegalMixCollation { code: u16, message: String },

    #[error("{message}")]
    Execution {
        code: u16,
        state: String,
        message: String,
        kind: ExecErrorKind,
    },

    #[error("{0} is not supported by this session")]
    Unsupported(&'static str),

    #[error("Client does not support authentication protocol requested by server; plugin '{0}'")]
    UnknownAuthPlugin(String),

    #[error("command {0} not supported now")]
    UnknownCommand(u8),

    #[error("Unknown prepared statement handler ({0}) given to {1}")]
    UnknownStmtHandler(u32, &'static str),

    #[error("The statement ({0}) has no open cursor.")]
    CursorNotExist(u32),

    #[error("client has multi-statement capability disabled. Run SET GLOBAL multi_statement_mode='ON' after you understand the security risk")]
    MultiStatementDisabled,

    #[error("Query execution was interrupted")]
    QueryInterrupted,

    #[error("Too many connections")]
    TooManyConnections,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("{0}")]
    Panic(String),
}

pub type Result<T> = std::result::Result<T, FrontendError>;

fn yes_no(flag: &bool) -> &'static str {
    if *flag {
        "YES"
    } else {
        "NO"
    }
}

/// The (code, SQLSTATE, message) triple written into an ERR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlError {
    pub code: u16,
    pub state: String,
    pub message: String,
}

impl SqlError {
    pub fn new(code: u16, state: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            state: state.to_string(),
            message: message.into(),
        }
    }
}

pub const ER_UNKNOWN_ERROR: u16 = 1105;
pub const ER_ACCESS_DENIED: u16 = 1045;
pub const ER_CON_COUNT: u16 = 1040;
pub const ER_ABORTING_CONNECTION: u16 = 1184;
pub const ER_NET_PACKET_TOO_LARGE: u16 = 1153;
pub const ER_SECURE_TRANSPORT_REQUIRED: u16 = 3159;
pub const ER_CANT_AGGREGATE_2COLLATIONS: u16 = 1267;
pub const ER_CANT_AGGREGATE_3COLLATIONS: u16 = 1270;
pub const ER_CANT_AGGREGATE_NCOLLATIONS: u16 = 1271;
pub const ER_QUERY_INTERRUPTED: u16 = 1317;
pub const ER_UNKNOWN_STMT_HANDLER: u16 = 1243;
pub const ER_STMT_HAS_NO_OPEN_CURSOR: u16 = 1421;
pub const ER_MALFORMED_PACKET: u16 = 1047;
pub const ER_NOT_SUPPORTED_AUTH_MODE: u16 = 1251;
pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
pub const ER_MULTI_STATEMENT_DISABLED: u16 = 8130;
pub const ER_NOT_SUPPORTED_YET: u16 = 1235;
pub const ER_WRONG_PARAMCOUNT_TO_NATIVE_FCT: u16 = 1582;

impl FrontendError {
    pub fn execution(code: u16, state: &str, message: impl Into<String>) -> Self {
        FrontendError::Execution {
            code,
            state: state.to_string(),
            message: message.into(),
            kind: ExecErrorKind::Normal,
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        FrontendError::Execution {
            code: ER_UNKNOWN_ERROR,
            state: "HY000".to_string(),
            message: message.into(),
            kind: ExecErrorKind::Critical,
        }
    }

    pub fn result_undetermined(message: impl Into<String>) -> Self {
        FrontendError::Execution {
            code: ER_UNKNOWN_ERROR,
            state: "HY000".to_string(),
            message: message.into(),
            kind: ExecErrorKind::ResultUndetermined,
        }
    }

    pub fn engine_unavailable(message: impl Into<String>) -> Self {
        FrontendError::Execution {
            code: ER_UNKNOWN_ERROR,
            state: "HY000".to_string(),
            message: message.into(),
            kind: ExecErrorKind::EngineUnavailable,
        }
    }

    pub fn lock_wait_timeout() -> Self {
        Self::execution(
            ER_LOCK_WAIT_TIMEOUT,
            "HY000",
            "Lock wait timeout exceeded; try restarting transaction",
        )
    }

    pub fn wrong_param_count(func_name: &str) -> Self {
        Self::execution(
            ER_WRONG_PARAMCOUNT_TO_NATIVE_FCT,
            "42000",
            format!("Incorrect parameter count in the call to native function '{}'", func_name),
        )
    }

    pub fn malformed(what: impl Into<String>) -> Self {
        FrontendError::Malformed(what.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            FrontendError::Io(_)
            | FrontendError::Malformed(_)
            | FrontendError::PacketTooLarge
            | FrontendError::Tls(_) => ErrorClass::Protocol,
            FrontendError::SecureTransportRequired
            | FrontendError::AccessDenied { .. }
            | FrontendError::AbortingConnection { .. }
            | FrontendError::UnknownAuthPlugin(_)
            | FrontendError::TooManyConnections => ErrorClass::Auth,
            FrontendError::Timeout => ErrorClass::Timeout,
            FrontendError::IllegalMixCollation { .. } => ErrorClass::Collation,
            FrontendError::Execution { kind, .. } => match kind {
                ExecErrorKind::Normal | ExecErrorKind::EngineUnavailable => ErrorClass::Execution,
                ExecErrorKind::ResultUndetermined | ExecErrorKind::Critical => {
                    ErrorClass::Critical
                }
            },
            FrontendError::Panic(_) => ErrorClass::Critical,
            FrontendError::ConnectionClosed => ErrorClass::Disconnect,
            FrontendError::Unsupported(_)
            | FrontendError::UnknownCommand(_)
            | FrontendError::UnknownStmtHandler(..)
            | FrontendError::CursorNotExist(_)
            | FrontendError::MultiStatementDisabled
            | FrontendError::QueryInterrupted
            | FrontendError::Config(_) => ErrorClass::Execution,
        }
    }

    /// True when the connection has to be torn down after reporting this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.class(),
            ErrorClass::Execution | ErrorClass::Collation
        )
    }

    pub fn is_retryable_engine_error(&self) -> bool {
        matches!(
            self,
            FrontendError::Execution {
                kind: ExecErrorKind::EngineUnavailable,
                ..
            }
        )
    }

    pub fn to_sql_error(&self) -> SqlError {
        let message = self.to_string();
        match self {
            FrontendError::AccessDenied { .. } => SqlError::new(ER_ACCESS_DENIED, "28000", message),
            FrontendError::AbortingConnection { .. } => {
                SqlError::new(ER_ABORTING_CONNECTION, "08S01", message)
            }
            FrontendError::PacketTooLarge => SqlError::new(ER_NET_PACKET_TOO_LARGE, "08S01", message),
            FrontendError::SecureTransportRequired => {
                SqlError::new(ER_SECURE_TRANSPORT_REQUIRED, "HY000", message)
            }
            FrontendError::IllegalMixCollation { code, .. } => SqlError::new(*code, "HY000", message),
            FrontendError::Execution { code, state, .. } => SqlError::new(*code, state, message),
            FrontendError::Malformed(_) => SqlError::new(ER_MALFORMED_PACKET, "08S01", "Malformed packet"),
            FrontendError::UnknownAuthPlugin(_) => {
                SqlError::new(ER_NOT_SUPPORTED_AUTH_MODE, "08004", message)
            }
            FrontendError::UnknownStmtHandler(..) => {
                SqlError::new(ER_UNKNOWN_STMT_HANDLER, "HY000", message)
            }
            FrontendError::CursorNotExist(_) => {
                SqlError::new(ER_STMT_HAS_NO_OPEN_CURSOR, "HY000", message)
            }
            FrontendError::MultiStatementDisabled => {
                SqlError::new(ER_MULTI_STATEMENT_DISABLED, "HY000", message)
            }
            FrontendError::QueryInterrupted => SqlError::new(ER_QUERY_INTERRUPTED, "70100", message),
            FrontendError::TooManyConnections => SqlError::new(ER_CON_COUNT, "08004", message),
            FrontendError::Unsupported(_) => SqlError::new(ER_NOT_SUPPORTED_YET, "42000", message),
            _ => SqlError::new(ER_UNKNOWN_ERROR, "HY000", message),
        }
    }
}
