use crate::dataset::{MatchPolicy, Query};
use thiserror::Error;
use tracing::debug;

/// Output lines of the last timed attempt of one engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    pub engine: String,
    pub lines: Vec<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error(
        "Query {query} ({policy}): output of {other} differs from {reference}\n\
         {reference}: {reference_lines:?}\n\
         {other}: {other_lines:?}"
    )]
    Mismatch {
        query: String,
        policy: MatchPolicy,
        reference: String,
        other: String,
        reference_lines: Vec<String>,
        other_lines: Vec<String>,
    },
}

fn agrees(policy: MatchPolicy, reference: &[String], other: &[String]) -> bool {
    match policy {
        MatchPolicy::Exact => reference == other,
        MatchPolicy::CountOnly => reference.len() == other.len(),
    }
}

/// check that every engine agrees with the first one under the query's match policy
pub fn verify(query: &Query, outputs: &[EngineOutput]) -> Result<(), VerifyError> {
    let Some((reference, others)) = outputs.split_first() else {
        return Ok(());
    };

    if let Some(other) = others
        .iter()
        .find(|other| !agrees(query.policy, &reference.lines, &other.lines))
    {
        return Err(VerifyError::Mismatch {
            query: query.name.clone(),
            policy: query.policy,
            reference: reference.engine.clone(),
            other: other.engine.clone(),
            reference_lines: reference.lines.clone(),
            other_lines: other.lines.clone(),
        });
    }

    debug!(query = %query.name, policy = %query.policy, engines = outputs.len(), "Outputs agree");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(policy: MatchPolicy) -> Query {
        Query {
            name: "1".to_owned(),
            text: "select 1;".to_owned(),
            policy,
        }
    }

    fn output(engine: &str, lines: &[&str]) -> EngineOutput {
        EngineOutput {
            engine: engine.to_owned(),
            lines: lines.iter().map(|line| line.to_string()).collect(),
        }
    }

    #[test]
    fn exact_accepts_identical_outputs() {
        let outputs = [
            output("sqlite3", &["1|a", "2|b", ""]),
            output("engine", &["1|a", "2|b", ""]),
        ];

        assert_eq!(verify(&query(MatchPolicy::Exact), &outputs), Ok(()));
    }

    #[test]
    fn exact_names_the_differing_engine() {
        let outputs = [
            output("sqlite3", &["1|a", "2|b"]),
            output("engine", &["1|a", "2|b"]),
            output("other", &["1|a", "2|c"]),
        ];

        let Err(VerifyError::Mismatch {
            reference,
            other,
            other_lines,
            ..
        }) = verify(&query(MatchPolicy::Exact), &outputs)
        else {
            panic!("expected a mismatch");
        };

        assert_eq!(reference, "sqlite3");
        assert_eq!(other, "other");
        assert_eq!(other_lines, vec!["1|a", "2|c"]);
    }

    #[test]
    fn count_only_compares_line_numbers() {
        let same_length = [
            output("sqlite3", &["0.30000000000000004"]),
            output("engine", &["0.3"]),
        ];
        let different_length = [output("sqlite3", &["1", "2"]), output("engine", &["1"])];

        assert!(verify(&query(MatchPolicy::CountOnly), &same_length).is_ok());
        assert!(verify(&query(MatchPolicy::CountOnly), &different_length).is_err());
    }

    #[test]
    fn fewer_than_two_engines_always_agree() {
        assert!(verify(&query(MatchPolicy::Exact), &[]).is_ok());
        assert!(verify(&query(MatchPolicy::Exact), &[output("sqlite3", &["1"])]).is_ok());
    }
}
