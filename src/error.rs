#![forbid(unsafe_code)]

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("cannot resolve address of member `{member}`: {reason}")]
    MembershipResolution { member: String, reason: String },
    #[error("failed to start `{component}`: {source}")]
    SubComponentStart {
        component: String,
        #[source]
        source: Box<Error>,
    },
    #[error("failed to stop `{component}`: {source}")]
    SubComponentStop {
        component: String,
        #[source]
        source: Box<Error>,
    },
    #[error("operation `{operation}` is not supported by `{entity}`")]
    Unsupported {
        operation: &'static str,
        entity: String,
    },
    #[error("lifecycle transition error: {0}")]
    Transition(#[from] crate::lifecycle::TransitionError),
    #[error("deployment config error: {0}")]
    Deployment(#[from] crate::config::deployment::DeploymentConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("settings error: {0}")]
    Settings(#[from] config::ConfigError),
    #[error("duration parse error: {0}")]
    Duration(#[from] humantime::DurationError),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn new<E>(error: E) -> Self
    where
        Error: From<E>,
    {
        error.into()
    }

    pub fn msg<M>(message: M) -> Self
    where
        M: Into<String>,
    {
        Self::Message(message.into())
    }

    pub fn configuration<M>(message: M) -> Self
    where
        M: Into<String>,
    {
        Self::Configuration(message.into())
    }

    pub fn with_context<M>(context: M, source: Error) -> Self
    where
        M: Into<String>,
    {
        Self::Context {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn start_failed(component: impl Into<String>, source: Error) -> Self {
        Self::SubComponentStart {
            component: component.into(),
            source: Box::new(source),
        }
    }

    pub fn stop_failed(component: impl Into<String>, source: Error) -> Self {
        Self::SubComponentStop {
            component: component.into(),
            source: Box::new(source),
        }
    }

    /// Unwraps `Context` layers down to the error that caused them.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self.root(), Error::Configuration(_))
    }
}

pub trait Context<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    Error: From<E>,
{
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.map_err(|err| Error::with_context(context.into(), err.into()))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|err| Error::with_context(f().into(), err.into()))
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Error::Message(value)
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Self {
        Error::Message(value.to_string())
    }
}

#[macro_export]
macro_rules! err {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {{
        $crate::error::Error::msg(format!($fmt $(, $arg)*))
    }};
    ($err:expr) => {{
        $crate::error::Error::new($err)
    }};
}
