use thiserror::Error;

/// Engine-level failures. Per-student conditions (`InsufficientData`,
/// `NoGradedSubjects`) are recovered by the bulletin builder and encoded as
/// null fields; the structural ones abort the current unit of work.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no scores recorded for this subject in the term")]
    InsufficientData,

    #[error("student has no graded subject in the term")]
    NoGradedSubjects,

    #[error("bulletin for student {student_id} is validated; supersede it instead")]
    AlreadyValidated { student_id: String },

    #[error("term {term_id} is closed")]
    TermClosed { term_id: String },

    #[error("bulletin for student {student_id} is not validated")]
    NotValidated { student_id: String },

    #[error("{what} not found")]
    NotFound { what: &'static str },

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl EngineError {
    pub fn not_found(what: &'static str) -> Self {
        EngineError::NotFound { what }
    }

    /// Stable wire code for the IPC error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InsufficientData => "insufficient_data",
            EngineError::NoGradedSubjects => "no_graded_subjects",
            EngineError::AlreadyValidated { .. } => "already_validated",
            EngineError::TermClosed { .. } => "term_closed",
            EngineError::NotValidated { .. } => "not_validated",
            EngineError::NotFound { .. } => "not_found",
            EngineError::Db(_) => "db_query_failed",
        }
    }
}
