//! The framed request/reply loop driving publisher sessions
//!
//! Wire format: little-endian u32 command id, little-endian u32 body
//! size, then the body; replies are u32 size plus body. A short read on
//! any field means the peer went away and ends the loop cleanly. The
//! reactor is single-threaded; the caller wires it to a process or
//! thread per session.

use crate::error::ReceiverError;
use crate::token::{self, TokenError};
use serde::Deserialize;
use serde_json::json;
use std::io::{Read, Write};
use tracing::{debug, warn};

/// Session commands, in wire order
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// End the session; replies `"ok"`
    Quit,
    /// Echo the body back
    Echo,
    /// Issue a lease token
    GenerateToken,
    /// Recover a token's public id
    GetTokenId,
    /// Validate a token against its secret
    CheckToken,
    /// Reserved; answered with an explicit not-implemented error
    SubmitPayload,
}

impl Command {
    /// Wire id of this command
    pub fn id(&self) -> i32 {
        match self {
            Command::Quit => 0,
            Command::Echo => 1,
            Command::GenerateToken => 2,
            Command::GetTokenId => 3,
            Command::CheckToken => 4,
            Command::SubmitPayload => 5,
        }
    }

    fn from_id(id: i32) -> Option<Self> {
        match id {
            0 => Some(Command::Quit),
            1 => Some(Command::Echo),
            2 => Some(Command::GenerateToken),
            3 => Some(Command::GetTokenId),
            4 => Some(Command::CheckToken),
            5 => Some(Command::SubmitPayload),
            _ => None,
        }
    }
}

/// Write one request frame: command id, body size, body
pub fn write_request<W: Write>(
    writer: &mut W,
    command: Command,
    body: &[u8],
) -> std::io::Result<()> {
    writer.write_all(&command.id().to_le_bytes())?;
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(body)
}

/// Read one reply frame: body size, body
pub fn read_reply<R: Read>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut size_bytes = [0u8; 4];
    reader.read_exact(&mut size_bytes)?;
    let size = u32::from_le_bytes(size_bytes) as usize;
    let mut body = vec![0u8; size];
    reader.read_exact(&mut body)?;
    Ok(body)
}

#[derive(Deserialize)]
struct GenerateTokenRequest {
    key_id: String,
    path: String,
    max_lease_time: u64,
}

#[derive(Deserialize)]
struct CheckTokenRequest {
    token: String,
    secret: String,
}

/// The session reactor over a pair of byte streams
pub struct Reactor<R: Read, W: Write> {
    input: R,
    output: W,
}

impl<R: Read, W: Write> Reactor<R, W> {
    /// Wrap the session's input and output streams
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Drive the loop until Quit, peer hangup, or a fatal request error
    pub fn run(&mut self) -> Result<(), ReceiverError> {
        loop {
            let Some((id, body)) = self.read_request()? else {
                debug!("request stream closed, reactor exiting");
                return Ok(());
            };
            let Some(command) = Command::from_id(id) else {
                warn!(id, "unknown command, reactor exiting");
                return Err(ReceiverError::UnknownCommand(id));
            };
            debug!(command = ?command, body_len = body.len(), "request received");
            match command {
                Command::Quit => {
                    self.write_reply(b"ok")?;
                    return Ok(());
                }
                Command::Echo => self.write_reply(&body)?,
                Command::GenerateToken => self.handle_generate_token(&body)?,
                Command::GetTokenId => self.handle_get_token_id(&body)?,
                Command::CheckToken => self.handle_check_token(&body)?,
                Command::SubmitPayload => {
                    let reply = json!({"status": "error", "reason": "not_implemented"});
                    self.write_reply(reply.to_string().as_bytes())?;
                }
            }
        }
    }

    /// One frame, or None on a short read (peer hung up)
    fn read_request(&mut self) -> Result<Option<(i32, Vec<u8>)>, ReceiverError> {
        let mut id_bytes = [0u8; 4];
        if read_exact_or_eof(&mut self.input, &mut id_bytes)?.is_none() {
            return Ok(None);
        }
        let id = i32::from_le_bytes(id_bytes);

        let mut size_bytes = [0u8; 4];
        if read_exact_or_eof(&mut self.input, &mut size_bytes)?.is_none() {
            return Ok(None);
        }
        let size = u32::from_le_bytes(size_bytes) as usize;

        let mut body = vec![0u8; size];
        if size > 0 && read_exact_or_eof(&mut self.input, &mut body)?.is_none() {
            return Ok(None);
        }
        Ok(Some((id, body)))
    }

    fn write_reply(&mut self, body: &[u8]) -> Result<(), ReceiverError> {
        self.output.write_all(&(body.len() as u32).to_le_bytes())?;
        self.output.write_all(body)?;
        self.output.flush()?;
        Ok(())
    }

    fn handle_generate_token(&mut self, body: &[u8]) -> Result<(), ReceiverError> {
        let request: GenerateTokenRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => return self.fail_malformed(&e.to_string()),
        };
        let reply = match token::generate_session_token(
            &request.key_id,
            &request.path,
            request.max_lease_time,
        ) {
            Ok(issued) => json!({
                "token": issued.token,
                "id": issued.id,
                "secret": issued.secret,
            }),
            Err(e) => return self.fail_malformed(&e.to_string()),
        };
        self.write_reply(reply.to_string().as_bytes())
    }

    fn handle_get_token_id(&mut self, body: &[u8]) -> Result<(), ReceiverError> {
        // The body is the raw token string, not JSON.
        let token_str = String::from_utf8_lossy(body);
        let reply = match token::get_token_public_id(&token_str) {
            Ok(id) => json!({"status": "ok", "id": id}),
            Err(_) => json!({"status": "error", "reason": "invalid_token"}),
        };
        self.write_reply(reply.to_string().as_bytes())
    }

    fn handle_check_token(&mut self, body: &[u8]) -> Result<(), ReceiverError> {
        let request: CheckTokenRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => return self.fail_malformed(&e.to_string()),
        };
        let reply = match token::check_token(&request.token, &request.secret) {
            Ok(path) => json!({"status": "ok", "path": path}),
            Err(TokenError::Expired) => json!({"status": "error", "reason": "expired_token"}),
            Err(_) => json!({"status": "error", "reason": "invalid_token"}),
        };
        self.write_reply(reply.to_string().as_bytes())
    }

    /// A request body the reactor cannot parse is fatal for the session:
    /// answer with an error reply, then exit the loop.
    fn fail_malformed(&mut self, detail: &str) -> Result<(), ReceiverError> {
        let reply = json!({"status": "error", "reason": "malformed_request"});
        self.write_reply(reply.to_string().as_bytes())?;
        Err(ReceiverError::MalformedRequest(detail.to_string()))
    }
}

/// read_exact, but a clean EOF before the first byte (or mid-buffer)
/// yields None instead of an error
fn read_exact_or_eof<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<Option<()>, ReceiverError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(None),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ReceiverError::Io(e)),
        }
    }
    Ok(Some(()))
}
