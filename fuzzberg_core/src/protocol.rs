use crate::transport::{QueryOutcome, QueryTransport};
use log::debug;

/// Result of submitting the whole query set for one mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundVerdict {
    Passed,
    Failed { query: String, reason: String },
    TimedOut { query: String },
}

/// Runs the session's query set against the target and counts executions.
pub struct QueryRunner {
    transport: Box<dyn QueryTransport>,
    queries: Vec<String>,
    execs: u64,
}

impl QueryRunner {
    /// Creates a runner that submits `queries`, in order, through `transport`.
    ///
    /// # Arguments
    /// * `transport`: Connection to the target, owned for the whole session.
    /// * `queries`: The validated, non-empty query set.
    pub fn new(transport: Box<dyn QueryTransport>, queries: Vec<String>) -> Self {
        Self {
            transport,
            queries,
            execs: 0,
        }
    }

    /// Submits every query in order, stopping at the first one that does not succeed.
    pub fn submit_all(&mut self) -> RoundVerdict {
        for query in &self.queries {
            self.execs += 1;
            match self.transport.submit(query) {
                QueryOutcome::Ok => debug!("exec #{}: ok", self.execs),
                QueryOutcome::Failed(reason) => {
                    debug!("exec #{}: failed: {reason}", self.execs);
                    return RoundVerdict::Failed {
                        query: query.clone(),
                        reason,
                    };
                }
                QueryOutcome::TimedOut => {
                    return RoundVerdict::TimedOut {
                        query: query.clone(),
                    };
                }
            }
        }
        RoundVerdict::Passed
    }

    /// Number of queries submitted so far, including the one that failed.
    pub fn execs(&self) -> u64 {
        self.execs
    }

    pub fn transport_mut(&mut self) -> &mut dyn QueryTransport {
        self.transport.as_mut()
    }

    /// Closes the transport. Called once at teardown.
    pub fn close(&mut self) {
        self.transport.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_utils::ScriptedTransport;

    fn queries() -> Vec<String> {
        vec!["SELECT 1".to_string(), "SELECT 2".to_string(), "SELECT 3".to_string()]
    }

    #[test]
    fn passing_round_counts_every_query() {
        let transport = ScriptedTransport::always_ok();
        let log = transport.log();
        let mut runner = QueryRunner::new(Box::new(transport), queries());

        assert_eq!(runner.submit_all(), RoundVerdict::Passed);
        assert_eq!(runner.submit_all(), RoundVerdict::Passed);
        assert_eq!(runner.execs(), 6);
        assert_eq!(log.submit_count(), 6);
    }

    #[test]
    fn first_failure_stops_the_round() {
        let transport = ScriptedTransport::new([
            QueryOutcome::Ok,
            QueryOutcome::Failed("connection reset".to_string()),
        ]);
        let log = transport.log();
        let mut runner = QueryRunner::new(Box::new(transport), queries());

        assert_eq!(
            runner.submit_all(),
            RoundVerdict::Failed {
                query: "SELECT 2".to_string(),
                reason: "connection reset".to_string()
            }
        );
        assert_eq!(runner.execs(), 2);
        assert_eq!(log.submitted(), vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn timeout_is_reported_with_its_query() {
        let transport = ScriptedTransport::new([QueryOutcome::TimedOut]);
        let mut runner = QueryRunner::new(Box::new(transport), queries());
        assert_eq!(
            runner.submit_all(),
            RoundVerdict::TimedOut {
                query: "SELECT 1".to_string()
            }
        );
        assert_eq!(runner.execs(), 1);
    }
}
