//! `bbctl`: a thin control-socket client for querying QA stats and
//! setting log verbosity on a running `seedd`.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::{Context as _, Result};

#[derive(Debug, Parser)]
#[clap(name = "bbctl", version)]
struct Args {
    #[clap(long, short, default_value = "/run/bitbabbler/control.sock")]
    socket: PathBuf,

    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// List active source identifiers.
    GetIds,
    /// Report QA statistics, optionally for a single source.
    ReportStats { source: Option<String> },
    /// Dump raw ENT histogram bins for a source.
    GetRawData { source: String },
    /// Set the daemon's log verbosity.
    SetLogVerbosity { level: i64 },
}

fn request_body(cmd: &Cmd) -> String {
    match cmd {
        Cmd::GetIds => "\"GetIDs\"".to_owned(),
        Cmd::ReportStats { source: Some(id) } => {
            serde_json::to_string(&("ReportStats", 0, id)).unwrap()
        }
        Cmd::ReportStats { source: None } => "\"ReportStats\"".to_owned(),
        Cmd::GetRawData { source } => serde_json::to_string(&("GetRawData", 0, source)).unwrap(),
        Cmd::SetLogVerbosity { level } => serde_json::to_string(&("SetLogVerbosity", 0, level)).unwrap(),
    }
}

fn send_request(socket: &PathBuf, body: &str) -> Result<String> {
    let mut stream = UnixStream::connect(socket).wrap_err("connecting to control socket")?;
    let mut framed = body.as_bytes().to_vec();
    framed.push(0);
    stream.write_all(&framed).wrap_err("writing request")?;

    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).wrap_err("reading response")?;
        if n == 0 {
            eyre::bail!("control socket closed before a terminated response arrived");
        }
        response.extend_from_slice(&chunk[..n]);
        if let Some(pos) = response.iter().position(|&b| b == 0) {
            response.truncate(pos);
            break;
        }
    }

    Ok(String::from_utf8_lossy(&response).into_owned())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let body = request_body(&args.command);
    let response = send_request(&args.socket, &body)?;

    let value: serde_json::Value = serde_json::from_str(&response).wrap_err("parsing response as JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_commands_encode_as_quoted_strings() {
        assert_eq!(request_body(&Cmd::GetIds), "\"GetIDs\"");
        assert_eq!(request_body(&Cmd::ReportStats { source: None }), "\"ReportStats\"");
    }

    #[test]
    fn commands_with_args_encode_as_arrays() {
        let body = request_body(&Cmd::ReportStats { source: Some("S-1".to_owned()) });
        assert_eq!(body, r#"["ReportStats",0,"S-1"]"#);
    }

    #[test]
    fn set_log_verbosity_encodes_integer_level() {
        assert_eq!(request_body(&Cmd::SetLogVerbosity { level: -2 }), r#"["SetLogVerbosity",0,-2]"#);
    }
}
