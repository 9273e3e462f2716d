/// Failures produced by [`crate::store::Store`] operations.
///
/// Each variant carries the human-readable message for that failure. The two
/// business-rule variants (`SessionAlreadyExists`, `SessionNotFound`) are
/// ordinary outcomes callers are expected to branch on; everything else is an
/// infrastructure failure of the operation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    FileCreateFailed(String),
    OpenFailed(String),
    SchemaCreateFailed(String),
    SessionInsertFailed(String),
    RequestInsertFailed(String),
    PurgeFailed(String),
    SessionAlreadyExists(String),
    SessionNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    FileCreateFailed,
    OpenFailed,
    SchemaCreateFailed,
    SessionInsertFailed,
    RequestInsertFailed,
    PurgeFailed,
    SessionAlreadyExists,
    SessionNotFound,
}

impl StoreError {
    pub fn kind(&self) -> StoreErrorKind {
        match self {
            Self::FileCreateFailed(_) => StoreErrorKind::FileCreateFailed,
            Self::OpenFailed(_) => StoreErrorKind::OpenFailed,
            Self::SchemaCreateFailed(_) => StoreErrorKind::SchemaCreateFailed,
            Self::SessionInsertFailed(_) => StoreErrorKind::SessionInsertFailed,
            Self::RequestInsertFailed(_) => StoreErrorKind::RequestInsertFailed,
            Self::PurgeFailed(_) => StoreErrorKind::PurgeFailed,
            Self::SessionAlreadyExists(_) => StoreErrorKind::SessionAlreadyExists,
            Self::SessionNotFound(_) => StoreErrorKind::SessionNotFound,
        }
    }

    /// Stable numeric code. Infrastructure failures are below 100, business
    /// rule violations start at 100.
    pub fn code(&self) -> u16 {
        match self.kind() {
            StoreErrorKind::FileCreateFailed => 1,
            StoreErrorKind::OpenFailed => 2,
            StoreErrorKind::SchemaCreateFailed => 3,
            StoreErrorKind::SessionInsertFailed => 4,
            StoreErrorKind::RequestInsertFailed => 5,
            StoreErrorKind::PurgeFailed => 6,
            StoreErrorKind::SessionAlreadyExists => 100,
            StoreErrorKind::SessionNotFound => 101,
        }
    }

    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            Self::SessionAlreadyExists(_) | Self::SessionNotFound(_)
        )
    }

    pub fn message(&self) -> &str {
        match self {
            Self::FileCreateFailed(message)
            | Self::OpenFailed(message)
            | Self::SchemaCreateFailed(message)
            | Self::SessionInsertFailed(message)
            | Self::RequestInsertFailed(message)
            | Self::PurgeFailed(message)
            | Self::SessionAlreadyExists(message)
            | Self::SessionNotFound(message) => message,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.kind() {
            StoreErrorKind::FileCreateFailed => "cannot create store file",
            StoreErrorKind::OpenFailed => "cannot open store",
            StoreErrorKind::SchemaCreateFailed => "cannot create store schema",
            StoreErrorKind::SessionInsertFailed => "cannot insert session",
            StoreErrorKind::RequestInsertFailed => "cannot insert request",
            StoreErrorKind::PurgeFailed => "cannot purge sessions",
            StoreErrorKind::SessionAlreadyExists | StoreErrorKind::SessionNotFound => {
                return f.write_str(self.message());
            }
        };
        write!(f, "{label}: {}", self.message())
    }
}

impl std::error::Error for StoreError {}
