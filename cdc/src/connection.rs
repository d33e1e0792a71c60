//! Blocking client for the CDC stream service. The protocol is plain
//! text over TCP: a hex-encoded authentication preamble, a REGISTER
//! exchange, then a REQUEST-DATA command answered with newline-terminated
//! JSON records, the first of which is the table schema.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde_json::Value;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::DEFAULT_TIMEOUT_SECS;

const OK_RESPONSE: &str = "OK";
const CLOSE_MSG: &str = "CLOSE";

#[derive(Debug, Error)]
pub enum CdcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("connection closed by server")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct CdcConnectionOptions {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,

    /// Network timeout for both reads and writes. An expired read while
    /// streaming means "no data yet", not an error.
    pub timeout: Duration,
}

impl Default for CdcConnectionOptions {
    fn default() -> Self {
        CdcConnectionOptions {
            hostname: "127.0.0.1".to_string(),
            port: 4001,
            username: String::default(),
            password: String::default(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// One change event, already split into schema and data views.
#[derive(Debug, Clone)]
pub struct CdcRow {
    pub raw: Value,
}

impl CdcRow {
    /// Field value by name, rendered as text the way the fields map does.
    pub fn value(&self, name: &str) -> Option<String> {
        self.raw.get(name).map(render_value)
    }
}

#[derive(Debug)]
pub struct CdcConnection {
    options: CdcConnectionOptions,
    reader: BufReader<TcpStream>,
    schema: Option<Value>,
    field_names: Vec<String>,
    is_open: bool,
}

impl CdcConnection {
    /// Connect, authenticate and register. The data stream starts only
    /// after [`CdcConnection::request_data`].
    pub fn connect(options: CdcConnectionOptions) -> Result<Self, CdcError> {
        let address = format!("{}:{}", options.hostname, options.port);
        let stream = TcpStream::connect(address)?;
        stream.set_read_timeout(Some(options.timeout))?;
        stream.set_write_timeout(Some(options.timeout))?;

        let mut connection = CdcConnection {
            options,
            reader: BufReader::new(stream),
            schema: None,
            field_names: Vec::new(),
            is_open: true,
        };

        connection.authenticate()?;
        connection.register()?;
        Ok(connection)
    }

    /// The schema record of the stream, once the first record arrived.
    pub fn schema(&self) -> Option<&Value> {
        self.schema.as_ref()
    }

    /// Field names from the schema record, in declaration order.
    pub fn fields(&self) -> &[String] {
        &self.field_names
    }

    /// Request the change stream of `db.table`, optionally from a GTID
    /// position in `domain-server_id-sequence` form.
    pub fn request_data(&mut self, table: &str, gtid: Option<&str>) -> Result<(), CdcError> {
        let mut message = format!("REQUEST-DATA {}", table);
        if let Some(gtid) = gtid {
            message.push(' ');
            message.push_str(gtid);
        }
        message.push('\n');

        self.write_all(message.as_bytes())
    }

    /// Read one change event. The first record of a stream is the schema
    /// and is consumed internally; callers only ever see data rows.
    /// `Ok(None)` means the read timed out with no data.
    pub fn read_row(&mut self) -> Result<Option<CdcRow>, CdcError> {
        loop {
            let Some(line) = self.read_line()? else {
                return Ok(None);
            };

            let record: Value = serde_json::from_str(&line)
                .map_err(|e| CdcError::MalformedRecord(format!("{}: {}", e, line)))?;

            // The schema record is the one carrying a `fields` array.
            if record.get("fields").map(|f| f.is_array()).unwrap_or(false) {
                self.field_names = extract_field_names(&record);
                debug!("received schema with {} fields", self.field_names.len());
                self.schema = Some(record);
                continue;
            }

            return Ok(Some(CdcRow { raw: record }));
        }
    }

    /// Terminate the stream. Closing an already closed connection does
    /// nothing.
    pub fn close(&mut self) -> Result<(), CdcError> {
        if self.is_open {
            self.is_open = false;
            let message = format!("{}\n", CLOSE_MSG);
            self.write_all(message.as_bytes())?;
        }
        Ok(())
    }

    fn authenticate(&mut self) -> Result<(), CdcError> {
        let auth = generate_auth_string(&self.options.username, &self.options.password);
        self.write_all(format!("{}\n", auth).as_bytes())?;

        match self.read_line()? {
            Some(line) if line.starts_with(OK_RESPONSE) => Ok(()),
            Some(line) => Err(CdcError::AuthRejected(line)),
            None => Err(CdcError::AuthRejected("no response".to_string())),
        }
    }

    fn register(&mut self) -> Result<(), CdcError> {
        let message = format!("REGISTER UUID={}, TYPE=JSON\n", Uuid::new_v4());
        self.write_all(message.as_bytes())?;

        match self.read_line()? {
            Some(line) if line.starts_with(OK_RESPONSE) => Ok(()),
            Some(line) => Err(CdcError::RegistrationRejected(line)),
            None => Err(CdcError::RegistrationRejected("no response".to_string())),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), CdcError> {
        self.reader.get_mut().write_all(data)?;
        Ok(())
    }

    /// One newline-terminated line, `Ok(None)` on a read timeout.
    fn read_line(&mut self) -> Result<Option<String>, CdcError> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Err(CdcError::Closed),
            Ok(_) => {
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                Ok(Some(line))
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for CdcConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// `hex(user:) + hex(sha1(password))`, the CDC authentication preamble.
fn generate_auth_string(user: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();

    let mut auth = hex::encode(format!("{}:", user).as_bytes());
    auth.push_str(&hex::encode(digest));
    auth
}

fn extract_field_names(schema: &Value) -> Vec<String> {
    schema
        .get("fields")
        .and_then(|f| f.as_array())
        .map(|fields| {
            fields
                .iter()
                .filter_map(|field| field.get("name"))
                .filter_map(|name| name.as_str())
                .map(|name| name.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
