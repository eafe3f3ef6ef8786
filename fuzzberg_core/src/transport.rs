use log::debug;
use reqwest::Url;
use reqwest::blocking::Client;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use thiserror::Error;

/// Per-attempt limit for the TCP reachability probe.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// What happened to one submitted query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// The server answered, whatever the status.
    Ok,
    /// The request failed below HTTP: refused, reset, broken mid-response.
    Failed(String),
    /// No answer within the request timeout. Fatal for the run.
    TimedOut,
}

/// Errors raised while setting up or probing a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid target URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Target at {target} is not accepting connections: {source}")]
    Unreachable { target: String, source: io::Error },

    #[error("Transport already closed")]
    Closed,
}

/// Authorization sent with every query as `<header>: Bearer <token>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub header: String,
    pub token: String,
}

impl AuthToken {
    pub fn bearer_value(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// Carries queries to the target. One transport is reused for the whole session.
pub trait QueryTransport {
    /// Checks that the target accepts connections, without sending a query.
    fn probe(&mut self) -> Result<(), TransportError>;

    fn submit(&mut self, query: &str) -> QueryOutcome;

    /// Releases the connection. Later calls to `submit` fail.
    fn close(&mut self);
}

/// HTTP POST transport: the query string is the request body.
pub struct HttpTransport {
    client: Option<Client>,
    url: Url,
    auth: Option<AuthToken>,
}

impl HttpTransport {
    /// Builds a blocking HTTP client for `url`.
    ///
    /// # Arguments
    /// * `url`: Endpoint the queries are POSTed to. Must have a host.
    /// * `auth`: Optional header sent with every request.
    /// * `request_timeout`: Limit for one query, connect through response body.
    ///
    /// # Returns
    /// The transport, or `TransportError::InvalidUrl`/`TransportError::Client`.
    pub fn new(
        url: &str,
        auth: Option<AuthToken>,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let url = Url::parse(url).map_err(|e| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if url.host_str().is_none() {
            return Err(TransportError::InvalidUrl {
                url: url.to_string(),
                reason: "no host".to_string(),
            });
        }
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(TransportError::Client)?;
        Ok(Self {
            client: Some(client),
            url,
            auth,
        })
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>, TransportError> {
        self.url
            .socket_addrs(|| None)
            .map_err(|source| TransportError::Unreachable {
                target: self.url.to_string(),
                source,
            })
    }
}

impl QueryTransport for HttpTransport {
    fn probe(&mut self) -> Result<(), TransportError> {
        if self.client.is_none() {
            return Err(TransportError::Closed);
        }
        let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
        for addr in self.resolve()? {
            match TcpStream::connect_timeout(&addr, PROBE_CONNECT_TIMEOUT) {
                Ok(_) => return Ok(()),
                Err(e) => last_error = e,
            }
        }
        Err(TransportError::Unreachable {
            target: self.url.to_string(),
            source: last_error,
        })
    }

    fn submit(&mut self, query: &str) -> QueryOutcome {
        let Some(client) = &self.client else {
            return QueryOutcome::Failed("transport closed".to_string());
        };
        let mut request = client.post(self.url.clone()).body(query.to_owned());
        if let Some(auth) = &self.auth {
            request = request.header(auth.header.as_str(), auth.bearer_value());
        }

        let response = match request.send() {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return QueryOutcome::TimedOut,
            Err(e) => return QueryOutcome::Failed(e.to_string()),
        };
        let status = response.status();
        match response.bytes() {
            Ok(body) => {
                debug!("Query answered with {status} ({} bytes)", body.len());
                QueryOutcome::Ok
            }
            Err(e) if e.is_timeout() => QueryOutcome::TimedOut,
            Err(e) => QueryOutcome::Failed(e.to_string()),
        }
    }

    fn close(&mut self) {
        self.client = None;
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::signal::InterruptFlag;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Shared view of what a [`ScriptedTransport`] saw, readable after the transport
    /// has been moved into a session.
    #[derive(Debug, Clone, Default)]
    pub struct ScriptLog {
        submitted: Rc<RefCell<Vec<String>>>,
        probes: Rc<Cell<usize>>,
        closes: Rc<Cell<usize>>,
    }

    impl ScriptLog {
        pub fn submitted(&self) -> Vec<String> {
            self.submitted.borrow().clone()
        }

        pub fn submit_count(&self) -> usize {
            self.submitted.borrow().len()
        }

        pub fn probes(&self) -> usize {
            self.probes.get()
        }

        pub fn closes(&self) -> usize {
            self.closes.get()
        }
    }

    /// Transport double that replays scripted outcomes.
    #[derive(Debug)]
    pub struct ScriptedTransport {
        script: VecDeque<QueryOutcome>,
        fallback: QueryOutcome,
        failing_probes: usize,
        raise_after: Option<(usize, InterruptFlag)>,
        log: ScriptLog,
    }

    impl ScriptedTransport {
        /// Replays `script` in order, then answers `Ok` forever.
        pub fn new(script: impl IntoIterator<Item = QueryOutcome>) -> Self {
            Self {
                script: script.into_iter().collect(),
                fallback: QueryOutcome::Ok,
                failing_probes: 0,
                raise_after: None,
                log: ScriptLog::default(),
            }
        }

        pub fn always_ok() -> Self {
            Self::new([])
        }

        pub fn with_fallback(mut self, fallback: QueryOutcome) -> Self {
            self.fallback = fallback;
            self
        }

        /// The first `count` probes report the target as unreachable.
        pub fn failing_probes(mut self, count: usize) -> Self {
            self.failing_probes = count;
            self
        }

        /// Raises `flag` once `submits` queries have been answered.
        pub fn raise_after(mut self, submits: usize, flag: InterruptFlag) -> Self {
            self.raise_after = Some((submits, flag));
            self
        }

        pub fn log(&self) -> ScriptLog {
            self.log.clone()
        }
    }

    impl QueryTransport for ScriptedTransport {
        fn probe(&mut self) -> Result<(), TransportError> {
            self.log.probes.set(self.log.probes.get() + 1);
            if self.failing_probes > 0 {
                self.failing_probes -= 1;
                return Err(TransportError::Unreachable {
                    target: "scripted".to_string(),
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, "scripted refusal"),
                });
            }
            Ok(())
        }

        fn submit(&mut self, query: &str) -> QueryOutcome {
            self.log.submitted.borrow_mut().push(query.to_string());
            if let Some((threshold, flag)) = &self.raise_after {
                if self.log.submit_count() >= *threshold {
                    flag.raise();
                }
            }
            self.script
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }

        fn close(&mut self) {
            self.log.closes.set(self.log.closes.get() + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::ScriptedTransport;
    use super::*;
    use crate::signal::InterruptFlag;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// Reads one HTTP/1.1 request (headers plus Content-Length body).
    fn read_request(stream: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= header_end + 4 + content_length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&raw).to_string()
    }

    fn serve_once(status_line: &'static str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/query", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream);
            let response =
                format!("{status_line}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nno");
            stream.write_all(response.as_bytes()).unwrap();
            tx.send(request).unwrap();
        });
        (url, rx)
    }

    fn token() -> AuthToken {
        AuthToken {
            header: "F-Authorization".to_string(),
            token: "secret".to_string(),
        }
    }

    #[test]
    fn answered_query_is_ok_even_with_error_status() {
        let (url, requests) = serve_once("HTTP/1.1 500 Internal Server Error");
        let mut transport =
            HttpTransport::new(&url, Some(token()), Duration::from_secs(5)).unwrap();

        assert_eq!(
            transport.submit("SELECT * FROM read_csv('fuzz.csv')"),
            QueryOutcome::Ok
        );

        let request = requests.recv().unwrap();
        assert!(request.starts_with("POST /query"));
        assert!(request.to_ascii_lowercase().contains("f-authorization: bearer secret"));
        assert!(request.ends_with("SELECT * FROM read_csv('fuzz.csv')"));
    }

    #[test]
    fn refused_connection_is_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut transport =
            HttpTransport::new(&format!("http://{addr}/"), None, Duration::from_secs(2)).unwrap();
        assert!(matches!(transport.submit("SELECT 1"), QueryOutcome::Failed(_)));
        assert!(matches!(
            transport.probe(),
            Err(TransportError::Unreachable { .. })
        ));
    }

    #[test]
    fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _ = read_request(&mut stream);
            thread::sleep(Duration::from_secs(3));
        });

        let mut transport = HttpTransport::new(&url, None, Duration::from_millis(300)).unwrap();
        assert_eq!(transport.submit("SELECT 1"), QueryOutcome::TimedOut);
    }

    #[test]
    fn probe_succeeds_against_listener_and_close_disables_submit() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let mut transport = HttpTransport::new(&url, None, Duration::from_secs(1)).unwrap();

        transport.probe().unwrap();
        transport.close();
        assert!(matches!(transport.probe(), Err(TransportError::Closed)));
        assert!(matches!(transport.submit("SELECT 1"), QueryOutcome::Failed(_)));
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(matches!(
            HttpTransport::new("not a url", None, Duration::from_secs(1)),
            Err(TransportError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn scripted_transport_replays_then_falls_back() {
        let mut transport = ScriptedTransport::new([QueryOutcome::Failed("boom".into())])
            .with_fallback(QueryOutcome::TimedOut)
            .failing_probes(1);
        let log = transport.log();

        assert!(transport.probe().is_err());
        assert!(transport.probe().is_ok());
        assert_eq!(transport.submit("a"), QueryOutcome::Failed("boom".into()));
        assert_eq!(transport.submit("b"), QueryOutcome::TimedOut);
        transport.close();

        assert_eq!(log.submitted(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(log.probes(), 2);
        assert_eq!(log.closes(), 1);
    }

    #[test]
    fn scripted_transport_raises_interrupt_after_threshold() {
        let flag = InterruptFlag::detached();
        let mut transport = ScriptedTransport::always_ok().raise_after(2, flag);
        transport.submit("one");
        assert!(!flag.is_set());
        transport.submit("two");
        assert!(flag.is_set());
    }
}
