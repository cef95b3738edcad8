//! patchbridge-client - command-line controller for a patchbridge relay.
//!
//! Queries print their results as JSON. Mutations print `{"ok":true}` once
//! the relay has applied them. Exit codes: 0 success, 1 rejected by the
//! relay, 2 client-side failure.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use patchbridge_core::client::{BridgeClient, ClientError, ClientOptions, DEFAULT_URL};
use patchbridge_core::emit_result;
use patchbridge_core::protocol::{
    Action, Atom, Command, CommandError, CommandFailure, MessageBody, ServerFrame,
};
use serde_json::{json, Map, Value};

#[derive(Parser, Debug)]
#[command(name = "patchbridge-client")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Relay websocket URL
    #[arg(long, env = "PATCHBRIDGE_URL", default_value = DEFAULT_URL)]
    url: String,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 30.0)]
    timeout: f64,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 10.0)]
    connect_timeout: f64,

    /// Print the full response wrapper (for debugging)
    #[arg(long)]
    raw_response: bool,

    /// Pretty-print JSON output
    #[arg(long)]
    pretty: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Snapshot the whole patch
    Patch,

    /// Snapshot the selected boxes
    Selected,

    /// Attributes of one box
    Attrs { varname: String },

    /// Bounding rectangle of every box
    AvoidRect,

    /// Create a box
    Add {
        obj_type: String,
        x: f64,
        y: f64,
        varname: String,
        /// Creation arguments
        args: Vec<String>,
    },

    /// Delete a box
    Remove { varname: String },

    /// Connect an outlet to an inlet
    Connect {
        src: String,
        dst: String,
        #[arg(long, default_value_t = 0)]
        outlet: u32,
        #[arg(long, default_value_t = 0)]
        inlet: u32,
    },

    /// Remove a connection
    Disconnect {
        src: String,
        dst: String,
        #[arg(long, default_value_t = 0)]
        outlet: u32,
        #[arg(long, default_value_t = 0)]
        inlet: u32,
    },

    /// Set an attribute (value is parsed as JSON, else taken as a string)
    SetAttr {
        varname: String,
        attr: String,
        value: String,
    },

    /// Replace a message or comment box's text
    SetText { varname: String, text: String },

    /// Set a number box
    SetNumber {
        varname: String,
        #[arg(allow_hyphen_values = true)]
        num: String,
    },

    /// Send a message, e.g. `send osc set 220`
    Send {
        varname: String,
        #[arg(required = true, allow_hyphen_values = true)]
        message: Vec<String>,
    },

    /// Send bang
    Bang { varname: String },

    /// Move the relay to another port
    SetPort {
        #[arg(allow_hyphen_values = true)]
        port: i64,
    },

    /// Relay status
    Status,

    /// Round-trip latency
    Ping,

    /// Send a raw command object
    Raw { json: String },
}

enum Request {
    Query(Action),
    Mutation(Action),
    Raw(Map<String, Value>),
    SetPort(i64),
    Status,
    Ping,
}

fn build_request(cmd: Cmd) -> Result<Request, ClientError> {
    Ok(match cmd {
        Cmd::Patch => Request::Query(Action::GetObjectsInPatch {}),
        Cmd::Selected => Request::Query(Action::GetObjectsInSelected {}),
        Cmd::Attrs { varname } => Request::Query(Action::GetObjectAttributes { varname }),
        Cmd::AvoidRect => Request::Query(Action::GetAvoidRectPosition {}),

        Cmd::Add {
            obj_type,
            x,
            y,
            varname,
            args,
        } => Request::Mutation(Action::AddObject {
            obj_type,
            position: [x, y],
            varname,
            args: args.iter().map(String::as_str).map(Atom::parse).collect(),
        }),
        Cmd::Remove { varname } => Request::Mutation(Action::RemoveObject { varname }),
        Cmd::Connect {
            src,
            dst,
            outlet,
            inlet,
        } => Request::Mutation(Action::ConnectObjects {
            src_varname: src,
            dst_varname: dst,
            outlet_idx: outlet,
            inlet_idx: inlet,
        }),
        Cmd::Disconnect {
            src,
            dst,
            outlet,
            inlet,
        } => Request::Mutation(Action::DisconnectObjects {
            src_varname: src,
            dst_varname: dst,
            outlet_idx: outlet,
            inlet_idx: inlet,
        }),
        Cmd::SetAttr {
            varname,
            attr,
            value,
        } => Request::Mutation(Action::SetObjectAttribute {
            varname,
            attr_name: attr,
            attr_value: serde_json::from_str(&value).unwrap_or(Value::String(value)),
        }),
        Cmd::SetText { varname, text } => Request::Mutation(Action::SetMessageText {
            varname,
            new_text: text,
        }),
        Cmd::SetNumber { varname, num } => Request::Mutation(Action::SetNumber {
            varname,
            num: serde_json::from_str(&num).map_err(ClientError::SerializeError)?,
        }),
        Cmd::Send { varname, message } => Request::Mutation(Action::SendMessageToObject {
            varname,
            message: MessageBody::Text(message.join(" ")),
        }),
        Cmd::Bang { varname } => Request::Mutation(Action::SendBangToObject { varname }),

        Cmd::Raw { json } => match serde_json::from_str(&json).map_err(ClientError::ParseError)? {
            Value::Object(map) => Request::Raw(map),
            _ => {
                return Err(ClientError::InvalidCommand(CommandFailure {
                    request_id: None,
                    error: CommandError::NotAnObject,
                }))
            }
        },

        Cmd::SetPort { port } => Request::SetPort(port),
        Cmd::Status => Request::Status,
        Cmd::Ping => Request::Ping,
    })
}

/// Send a mutation, then fence it with a query so any error frame it
/// caused has arrived before we report success.
async fn apply(client: &BridgeClient, action: Action) -> Result<Value, ClientError> {
    let mut events = client.subscribe();
    client.notify(action).await?;
    client.request(Action::GetAvoidRectPosition {}).await?;

    while let Ok(frame) = events.try_recv() {
        if let ServerFrame::Error { code, message, .. } = frame {
            return Err(ClientError::Rejected { code, message });
        }
    }
    Ok(json!({"ok": true}))
}

async fn run(cli: Cli) -> Result<Value, ClientError> {
    let request = build_request(cli.command)?;
    let options = ClientOptions {
        connect_timeout: Duration::from_secs_f64(cli.connect_timeout),
        request_timeout: Duration::from_secs_f64(cli.timeout),
    };
    let client = BridgeClient::connect(&cli.url, options).await?;

    let result = match request {
        Request::Query(action) => client.request(action).await,
        Request::Mutation(action) => apply(&client, action).await,
        Request::Raw(map) => {
            let command = Command::from_value(Value::Object(map.clone()));
            match command {
                Ok(cmd) if !cmd.action.is_query() => apply(&client, cmd.action).await,
                _ => client.request_object(map).await,
            }
        }
        Request::SetPort(port) => client.set_port(port).await.map(|p| json!({"port": p})),
        Request::Status => client
            .status()
            .await
            .and_then(|s| serde_json::to_value(s).map_err(ClientError::SerializeError)),
        Request::Ping => client
            .ping()
            .await
            .map(|rtt| json!({"pong": true, "rtt_ms": rtt.as_secs_f64() * 1000.0})),
    };

    let _ = client.close().await;
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let pretty = cli.pretty;
    let raw_response = cli.raw_response;

    match run(cli).await {
        Ok(result) => {
            let output = if raw_response {
                json!({"ok": true, "results": result})
            } else {
                result
            };
            println!("{}", emit_result(&output, pretty));
            ExitCode::from(0)
        }
        Err(e) => {
            let output = emit_result(&e.to_json(), pretty);
            match e {
                ClientError::Rejected { .. } | ClientError::InvalidCommand(_) => {
                    println!("{}", output);
                    ExitCode::from(1)
                }
                _ => {
                    eprintln!("{}", output);
                    ExitCode::from(2)
                }
            }
        }
    }
}
