//! Reproduces the "signal/message sender" tool described alongside the
//! reactor core: encodes one [`Message`] and delivers it over TCP or UDP,
//! then exits.
use std::io::Write;
use std::net::{TcpStream, UdpSocket};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use svcbus_reactor::message::{PARAM_REPLY_TO, PARAM_SECRET_CODE};
use svcbus_reactor::{Address, Message};
use tracing::{error, warn};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Transport {
    Tcp,
    Udp,
}

/// Deliver a single message to a running service over TCP or UDP.
#[derive(Parser, Debug)]
#[command(name = "signal-sender", version)]
struct Args {
    /// Target endpoint, `host:port`.
    #[arg(long)]
    host: String,

    /// Transport to use.
    #[arg(long, value_enum)]
    r#type: Transport,

    /// Message spec: `[server:]service/COMMAND`.
    #[arg(long)]
    message: String,

    /// Extra parameter, repeatable: `name=value`.
    #[arg(long = "param")]
    params: Vec<String>,

    /// Shared secret carried as the `secret_code` parameter.
    #[arg(long = "secret-code")]
    secret_code: Option<String>,

    /// Request a TLS-wrapped stream (TLS itself is outside this core; the
    /// sender warns and falls back to plaintext).
    #[arg(long)]
    encrypt: bool,

    /// For UDP, wait briefly for a reply datagram and print it.
    #[arg(long)]
    reply: bool,
}

const CONFIG_ERROR: u8 = 1;
const NETWORK_ERROR: u8 = 2;

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter("warn").init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

fn run(args: Args) -> Result<(), u8> {
    let (server, service, command) = parse_message_spec(&args.message).map_err(|e| {
        error!("invalid --message: {e}");
        CONFIG_ERROR
    })?;

    let addr = Address::parse(&args.host, "127.0.0.1", 0).map_err(|e| {
        error!("invalid --host: {e}");
        CONFIG_ERROR
    })?;
    let socket_addr = addr.socket_addr().ok_or_else(|| {
        error!("--host must be an IP endpoint, not a Unix path");
        CONFIG_ERROR
    })?;

    let mut message = Message::new(command).map_err(|e| {
        error!("invalid command in --message: {e}");
        CONFIG_ERROR
    })?;
    if let Some(server) = server {
        message.set_server(server);
    }
    message.set_service(service);
    message.add_version_parameter();

    for raw in &args.params {
        let (name, value) = raw.split_once('=').ok_or_else(|| {
            error!("--param `{raw}` is not `name=value`");
            CONFIG_ERROR
        })?;
        message.set_parameter(name, value);
    }

    if let Some(secret) = &args.secret_code {
        message.set_parameter(PARAM_SECRET_CODE, secret);
    }

    if args.encrypt {
        warn!("--encrypt requested but TLS wrapping is outside this core; sending in plaintext");
    }

    match args.r#type {
        Transport::Tcp => send_tcp(socket_addr, &message),
        Transport::Udp => send_udp(socket_addr, &mut message, args.reply),
    }
}

fn send_tcp(addr: std::net::SocketAddr, message: &Message) -> Result<(), u8> {
    let mut stream = TcpStream::connect(addr).map_err(|e| {
        error!("connect to {addr} failed: {e}");
        NETWORK_ERROR
    })?;
    let mut line = message.encode();
    line.push('\n');
    stream.write_all(line.as_bytes()).map_err(|e| {
        error!("send to {addr} failed: {e}");
        NETWORK_ERROR
    })?;
    Ok(())
}

fn send_udp(addr: std::net::SocketAddr, message: &mut Message, reply: bool) -> Result<(), u8> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(|e| {
        error!("failed to bind local UDP socket: {e}");
        NETWORK_ERROR
    })?;
    if reply {
        if let Ok(local) = socket.local_addr() {
            message.set_parameter(PARAM_REPLY_TO, local.to_string());
        }
    }
    let encoded = message.encode();
    socket.send_to(encoded.as_bytes(), addr).map_err(|e| {
        error!("send to {addr} failed: {e}");
        NETWORK_ERROR
    })?;

    if reply {
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .map_err(|e| {
                error!("failed to arm reply timeout: {e}");
                NETWORK_ERROR
            })?;
        let mut buf = [0u8; 64 * 1024];
        match socket.recv(&mut buf) {
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                println!("{text}");
            }
            Err(e) => {
                error!("no reply received: {e}");
                return Err(NETWORK_ERROR);
            }
        }
    }
    Ok(())
}

/// Parse the CLI's `[server:]service/COMMAND` shorthand. Note this is the
/// reverse nesting of the wire format's `server/service:COMMAND` — it is a
/// convenience for this tool's flag, not the wire grammar.
fn parse_message_spec(spec: &str) -> Result<(Option<String>, String, String), String> {
    let slash = spec
        .find('/')
        .ok_or_else(|| format!("`{spec}` is missing the `/COMMAND` suffix"))?;
    let (head, command) = (&spec[..slash], &spec[slash + 1..]);
    if command.is_empty() {
        return Err(format!("`{spec}` has an empty command"));
    }
    let (server, service) = match head.split_once(':') {
        Some((server, service)) => (Some(server.to_string()), service.to_string()),
        None => (None, head.to_string()),
    };
    if service.is_empty() {
        return Err(format!("`{spec}` has an empty service name"));
    }
    Ok((server, service, command.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_and_command() {
        let (server, service, command) = parse_message_spec("pinger/PING").unwrap();
        assert_eq!(server, None);
        assert_eq!(service, "pinger");
        assert_eq!(command, "PING");
    }

    #[test]
    fn parses_server_service_and_command() {
        let (server, service, command) = parse_message_spec("host1:pinger/PING").unwrap();
        assert_eq!(server, Some("host1".to_string()));
        assert_eq!(service, "pinger");
        assert_eq!(command, "PING");
    }

    #[test]
    fn rejects_missing_slash() {
        assert!(parse_message_spec("pinger:PING").is_err());
    }
}
