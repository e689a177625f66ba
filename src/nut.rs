//! Minimal client for the NUT (Network UPS Tools) `upsd` line protocol.
//!
//! Only the commands needed to read telemetry are spoken: optional login,
//! `LIST UPS` and `LIST VAR <ups>`. Each call, reconnect and login included,
//! has to finish within the configured timeout, so a wedged or trickling
//! daemon can never stall a poll cycle.

use std::{
    io::{self, BufRead, BufReader, Write},
    net::{TcpStream, ToSocketAddrs},
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::settings::NutSettings;
use crate::status::RawTelemetry;
use crate::ups::TelemetrySource;

// We use an arbitrary cap on list replies so a misbehaving daemon can't keep us reading forever.
const MAX_LIST_LINES: usize = 4096;
const MAX_LINE_LEN: usize = 4096;

#[derive(Debug, Error)]
pub enum NutError {
    #[error("could not resolve upsd address {0}")]
    Resolve(String),
    #[error("timed out talking to upsd")]
    Timeout,
    #[error("connection to upsd failed: {0}")]
    Io(io::Error),
    #[error("upsd closed the connection")]
    Closed,
    #[error("upsd returned ERR {0}")]
    Server(String),
    #[error("unexpected reply from upsd: {0}")]
    Protocol(String),
    #[error("{0} contains a line break")]
    LineBreak(&'static str),
}

impl From<io::Error> for NutError {
    fn from(err: io::Error) -> NutError {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => NutError::Timeout,
            _ => NutError::Io(err),
        }
    }
}

struct Session {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    // Set per call by `NutClient::with_session`.
    deadline: Instant,
}

impl Session {
    fn open(settings: &NutSettings, deadline: Instant) -> Result<Session, NutError> {
        let target = format!("{}:{}", settings.host, settings.port);

        let addrs = (settings.host.as_str(), settings.port)
            .to_socket_addrs()
            .map_err(|_| NutError::Resolve(target.clone()))?;

        let mut last_err = NutError::Resolve(target);
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, time_left(deadline)?) {
                Ok(stream) => {
                    debug!(%addr, "connected to upsd");

                    let mut session = Session {
                        reader: BufReader::new(stream.try_clone()?),
                        writer: stream,
                        deadline,
                    };
                    if let Some(username) = &settings.username {
                        session.command(&format!("USERNAME {}", quote("username", username)?))?;
                        session.expect_ok()?;
                    }
                    if let Some(password) = &settings.password {
                        session.command(&format!("PASSWORD {}", quote("password", password)?))?;
                        session.expect_ok()?;
                    }
                    return Ok(session);
                }
                Err(e) => last_err = e.into(),
            }
        }

        Err(last_err)
    }

    fn command(&mut self, cmd: &str) -> Result<(), NutError> {
        if !cmd.starts_with("PASSWORD") {
            trace!(cmd, "SEND");
        }
        self.writer.set_write_timeout(Some(time_left(self.deadline)?))?;
        self.writer.write_all(cmd.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, NutError> {
        let mut buf = Vec::new();
        loop {
            // Re-arm before every read so a trickle of bytes can't outlast the deadline.
            self.reader
                .get_ref()
                .set_read_timeout(Some(time_left(self.deadline)?))?;

            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                return Err(NutError::Closed);
            }
            let (taken, done) = match available.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    buf.extend_from_slice(&available[..end]);
                    (end + 1, true)
                }
                None => {
                    buf.extend_from_slice(available);
                    (available.len(), false)
                }
            };
            self.reader.consume(taken);

            if buf.len() > MAX_LINE_LEN {
                return Err(NutError::Protocol(format!(
                    "reply line longer than {} bytes",
                    MAX_LINE_LEN
                )));
            }
            if done {
                break;
            }
        }

        let line = String::from_utf8(buf)
            .map_err(|_| NutError::Protocol("reply is not UTF-8".to_string()))?;
        let line = line.trim_end_matches('\r').to_string();
        trace!(line = %line, "READ");

        if let Some(code) = line.strip_prefix("ERR ") {
            return Err(NutError::Server(code.trim().to_string()));
        }
        Ok(line)
    }

    fn expect_ok(&mut self) -> Result<(), NutError> {
        let line = self.read_line()?;
        if line.starts_with("OK") {
            Ok(())
        } else {
            Err(NutError::Protocol(line))
        }
    }

    /// Sends `LIST <query>` and returns each body line split into words.
    fn list(&mut self, query: &str) -> Result<Vec<Vec<String>>, NutError> {
        self.command(&format!("LIST {}", query))?;

        let begin = self.read_line()?;
        if begin != format!("BEGIN LIST {}", query) {
            return Err(NutError::Protocol(begin));
        }

        let end = format!("END LIST {}", query);
        let mut rows = Vec::new();
        for _ in 0..MAX_LIST_LINES {
            let line = self.read_line()?;
            if line == end {
                return Ok(rows);
            }
            rows.push(split_words(&line)?);
        }

        Err(NutError::Protocol(format!(
            "no END after {} lines of LIST {}",
            MAX_LIST_LINES, query
        )))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Best effort, upsd cleans up dead connections on its own.
        let _ = self.writer.write_all(b"LOGOUT\n");
    }
}

fn time_left(deadline: Instant) -> Result<Duration, NutError> {
    match deadline.checked_duration_since(Instant::now()) {
        Some(left) if !left.is_zero() => Ok(left),
        _ => Err(NutError::Timeout),
    }
}

/// Quotes a command argument the way [`split_words`] reads it back.
fn quote(what: &'static str, value: &str) -> Result<String, NutError> {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '\r' | '\n' => return Err(NutError::LineBreak(what)),
            '"' | '\\' => {
                quoted.push('\\');
                quoted.push(c);
            }
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    Ok(quoted)
}

/// Splits a reply line into words, honouring NUT's double quoted strings.
pub fn split_words(line: &str) -> Result<Vec<String>, NutError> {
    let mut words = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut word = String::new();
        match chars.next() {
            None => return Ok(words),
            Some('"') => loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(c) => word.push(c),
                        None => return Err(NutError::Protocol(line.to_string())),
                    },
                    Some(c) => word.push(c),
                    None => return Err(NutError::Protocol(line.to_string())),
                }
            },
            Some(c) => {
                word.push(c);
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    word.push(c);
                }
            }
        }
        words.push(word);
    }
}

/// A [`TelemetrySource`] backed by a `upsd` daemon.
///
/// The connection is kept between polls and reopened after any error.
pub struct NutClient {
    settings: NutSettings,
    session: Mutex<Option<Session>>,
}

impl NutClient {
    pub fn new(settings: NutSettings) -> NutClient {
        NutClient {
            settings,
            session: Mutex::new(None),
        }
    }

    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut Session) -> Result<T, NutError>,
    ) -> Result<T, NutError> {
        let deadline = Instant::now() + Duration::from_secs(self.settings.timeout_secs);
        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(Session::open(&self.settings, deadline)?);
        }

        let result = match guard.as_mut() {
            Some(session) => {
                session.deadline = deadline;
                f(session)
            }
            None => Err(NutError::Closed),
        };
        if result.is_err() {
            // Reconnect on the next call rather than reuse a connection in an unknown state.
            *guard = None;
        }
        result
    }
}

impl TelemetrySource for NutClient {
    fn list_units(&self) -> Result<Vec<String>, NutError> {
        let rows = self.with_session(|session| session.list("UPS"))?;

        // UPS <name> "<description>"
        rows.into_iter()
            .map(|row| match row.as_slice() {
                [kind, name, ..] if kind == "UPS" => Ok(name.clone()),
                _ => Err(NutError::Protocol(row.join(" "))),
            })
            .collect()
    }

    fn get_variables(&self, unit: &str) -> Result<RawTelemetry, NutError> {
        let rows = self.with_session(|session| session.list(&format!("VAR {}", unit)))?;

        // VAR <ups> <name> "<value>"
        let mut vars = RawTelemetry::new();
        for row in rows {
            match row.as_slice() {
                [kind, ups, name, value] if kind == "VAR" && ups == unit => {
                    vars.insert(name.clone(), value.clone());
                }
                _ => return Err(NutError::Protocol(row.join(" "))),
            }
        }
        Ok(vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("UPS myups \"APC Back-UPS\"", &["UPS", "myups", "APC Back-UPS"])]
    #[case("VAR myups ups.status \"OL CHRG\"", &["VAR", "myups", "ups.status", "OL CHRG"])]
    #[case("VAR a b \"say \\\"hi\\\"\"", &["VAR", "a", "b", "say \"hi\""])]
    #[case("VAR a b \"back\\\\slash\"", &["VAR", "a", "b", "back\\slash"])]
    #[case("VAR a b \"\"", &["VAR", "a", "b", ""])]
    #[case("  spaced   out  ", &["spaced", "out"])]
    #[case("", &[])]
    fn splits_reply_lines(#[case] line: &str, #[case] expected: &[&str]) {
        assert_eq!(split_words(line).unwrap(), expected);
    }

    #[rstest]
    #[case("VAR a b \"unterminated")]
    #[case("VAR a b \"dangling\\")]
    fn rejects_broken_quoting(#[case] line: &str) {
        assert!(matches!(split_words(line), Err(NutError::Protocol(_))));
    }

    #[rstest]
    #[case("monitor", "\"monitor\"")]
    #[case("two words", "\"two words\"")]
    #[case("say \"hi\"", "\"say \\\"hi\\\"\"")]
    #[case("back\\slash", "\"back\\\\slash\"")]
    #[case("", "\"\"")]
    fn quoted_arguments_split_back(#[case] value: &str, #[case] expected: &str) {
        let quoted = quote("password", value).unwrap();
        assert_eq!(quoted, expected);
        assert_eq!(split_words(&format!("PASSWORD {}", quoted)).unwrap(), ["PASSWORD", value]);
    }

    #[rstest]
    #[case("secret\nLOGOUT")]
    #[case("secret\r")]
    fn line_breaks_are_refused(#[case] value: &str) {
        assert!(matches!(quote("password", value), Err(NutError::LineBreak("password"))));
    }

    #[test]
    fn expired_deadline_is_a_timeout() {
        assert!(matches!(time_left(Instant::now()), Err(NutError::Timeout)));
        assert!(time_left(Instant::now() + Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn timeouts_are_classified() {
        let err: NutError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(err, NutError::Timeout));
        let err: NutError = io::Error::new(io::ErrorKind::ConnectionRefused, "nope").into();
        assert!(matches!(err, NutError::Io(_)));
    }
}
