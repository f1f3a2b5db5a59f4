//! Error taxonomy and aggregation.
//!
//! [`MonitorError`] covers the kinds named in the design: lifecycle
//! (illegal transitions), readiness (timeout/cancel/stderr text), and
//! child (kill-syscall failures). [`several_errors`] combines several
//! fallible outcomes into one aggregate whose rendering is part of the
//! external contract, so it is hand-written rather than derived.

use std::fmt;

/// A single fallible outcome from anywhere in the supervision engine.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("process-id-less")]
    ProcessIdLess,

    #[error("already killed")]
    AlreadyKilled,

    #[error("timeout error")]
    Timeout,

    #[error("user cancel")]
    UserCancel,

    #[error("already started")]
    AlreadyStarted,

    #[error("already stopped")]
    AlreadyStopped,

    #[error("monitoring is already stopped")]
    MonitoringStopped,

    #[error("{0}")]
    Message(String),

    #[error("{0}")]
    Aggregate(AggregateError),
}

impl MonitorError {
    pub fn message(text: impl Into<String>) -> Self {
        MonitorError::Message(text.into())
    }

    pub fn wrap(header: impl Into<String>, err: impl fmt::Display) -> Self {
        MonitorError::Message(format!("{}: {}", header.into(), err))
    }
}

/// An error combining several inner errors under one header.
///
/// Renders as `"<header>: <e1>; <e2>; …"`. This format is part of the
/// external contract and must not drift if the derive macro's default
/// changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateError {
    pub header: String,
    pub errors: Vec<MonitorError>,
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.header)?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

/// Combine several optional errors into one aggregate, dropping `None`s
/// and flattening any nested aggregates one level.
///
/// Returns `None` if every input was `None`.
pub fn several_errors(
    header: impl Into<String>,
    errs: impl IntoIterator<Item = Option<MonitorError>>,
) -> Option<MonitorError> {
    let mut flat = Vec::new();

    for err in errs.into_iter().flatten() {
        match err {
            MonitorError::Aggregate(inner) => {
                flat.extend(inner.errors);
                flat.push(MonitorError::Message(inner.header));
            }
            other => flat.push(other),
        }
    }

    if flat.is_empty() {
        return None;
    }

    Some(MonitorError::Aggregate(AggregateError {
        header: header.into(),
        errors: flat,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_nulls() {
        assert!(several_errors("header", [None, None]).is_none());
    }

    #[test]
    fn renders_with_header_and_semicolons() {
        let agg = several_errors(
            "failed to start",
            [Some(MonitorError::Timeout), Some(MonitorError::UserCancel)],
        )
        .unwrap();
        assert_eq!(agg.to_string(), "failed to start: timeout error; user cancel");
    }

    #[test]
    fn flattens_nested_aggregate_with_trailing_header() {
        let inner = several_errors("inner", [Some(MonitorError::Timeout)]).unwrap();
        let outer = several_errors("outer", [Some(inner), Some(MonitorError::UserCancel)]).unwrap();
        assert_eq!(outer.to_string(), "outer: timeout error; inner; user cancel");
    }

    #[test]
    fn single_error_has_no_semicolons() {
        let agg = several_errors("header", [Some(MonitorError::AlreadyStarted)]).unwrap();
        assert_eq!(agg.to_string(), "header: already started");
    }

    fn flat_errors_of(outcome: &Option<MonitorError>) -> Vec<MonitorError> {
        match outcome {
            Some(MonitorError::Aggregate(agg)) => agg.errors.clone(),
            Some(_) => unreachable!("several_errors always yields an Aggregate when non-empty"),
            None => Vec::new(),
        }
    }

    proptest::proptest! {
        /// Flattening is idempotent: an already-flat error collection
        /// (no nested aggregates left inside it) is unchanged by being
        /// flattened again under the same header.
        #[test]
        fn flattening_an_already_flat_collection_is_a_fixed_point(
            msgs in proptest::collection::vec("[a-zA-Z0-9 ]{1,12}", 0..6)
        ) {
            let leaves: Vec<MonitorError> = msgs.into_iter().map(MonitorError::message).collect();

            let once = several_errors("header", leaves.iter().cloned().map(Some));
            let once_errors = flat_errors_of(&once);

            let twice = several_errors("header", once_errors.iter().cloned().map(Some));
            let twice_errors = flat_errors_of(&twice);

            proptest::prop_assert_eq!(once_errors, twice_errors);
        }
    }
}
