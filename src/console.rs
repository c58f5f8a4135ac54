//! Line-oriented operator console.
//!
//! Each input line is parsed into a [`Command`], validated, and turned into
//! one or more runtime intents. Incoming messages and connection state
//! changes are printed as they happen, interleaved with command output.

use crate::error::{RuntimeError, ValidationError};
use crate::mqtt::config::ConnectionParameters;
use crate::mqtt::mqtt_handler::ConnectionState;
use crate::mqtt::topics::{QualityOfService, SubscriptionDescriptor};
use crate::runtime::{DraftEdit, Intent, RuntimeClient, RuntimeHandle, StatusReport};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

const DEFAULT_MESSAGE_COUNT: usize = 20;

pub const HELP: &str = "\
connect                         open a connection with the current parameters
disconnect                      close the connection
status                          show connection state and counters
set <field> <value>             change url|client|user|password while disconnected
reconfigure <field> <value>     disconnect, then change the parameter
topic <topic>                   set the publish topic
payload <text>                  set the publish payload
qos <0|1|2>                     set the publish QoS
retain <true|false>             set the publish retain flag
pub                             publish the draft
clear [topic]                   clear the retained message (draft topic by default)
sub [filter [qos]]              subscribe (the subscribe draft without arguments)
subdraft <filter> [qos]         set the subscribe draft
unsub <filter>                  unsubscribe
topics                          list subscriptions
messages [n]                    show the last n received messages
save [name]                     save the live session (active name by default)
switch <name>                   switch to another context
delete <name>                   delete a stored context
contexts                        list stored contexts
help                            this text
quit                            leave";

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("unknown command {0:?}, try `help`")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionField {
    Url,
    ClientId,
    Username,
    Password,
}

impl ConnectionField {
    fn apply(self, params: &mut ConnectionParameters, value: String) {
        match self {
            ConnectionField::Url => params.url = value,
            ConnectionField::ClientId => params.client_id = value,
            ConnectionField::Username => params.username = value,
            ConnectionField::Password => params.password = value,
        }
    }
}

impl FromStr for ConnectionField {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "url" => Ok(ConnectionField::Url),
            "client" | "client-id" => Ok(ConnectionField::ClientId),
            "user" | "username" => Ok(ConnectionField::Username),
            "password" => Ok(ConnectionField::Password),
            _ => Err(ParseError::Usage("set <url|client|user|password> <value>")),
        }
    }
}

impl fmt::Display for ConnectionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionField::Url => "url",
            ConnectionField::ClientId => "client id",
            ConnectionField::Username => "username",
            ConnectionField::Password => "password",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    Status,
    SetConnection(ConnectionField, String),
    Reconfigure(ConnectionField, String),
    SetTopic(String),
    SetPayload(String),
    SetQos(QualityOfService),
    SetRetain(bool),
    Publish,
    ClearRetained(Option<String>),
    Subscribe(Option<SubscriptionDescriptor>),
    SetSubscribeDraft(SubscriptionDescriptor),
    Unsubscribe(String),
    Topics,
    Messages(usize),
    Save(Option<String>),
    Switch(String),
    Delete(String),
    Contexts,
    Help,
    Quit,
}

fn required(rest: &str, usage: &'static str) -> Result<String, ParseError> {
    let value = rest.trim();
    if value.is_empty() {
        return Err(ParseError::Usage(usage));
    }
    Ok(value.to_string())
}

fn optional(rest: &str) -> Option<String> {
    let value = rest.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_flag(value: &str) -> Result<bool, ValidationError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "1" | "yes" => Ok(true),
        "false" | "off" | "0" | "no" => Ok(false),
        _ => Err(ValidationError::InvalidFlag(value.trim().to_string())),
    }
}

/// Filter plus optional QoS, defaulting to 0.
fn parse_descriptor(rest: &str) -> Result<SubscriptionDescriptor, ParseError> {
    let mut parts = rest.split_whitespace();
    let filter = parts.next().ok_or(ValidationError::Empty("topic filter"))?;
    let qos = match parts.next() {
        Some(raw) => raw.parse::<QualityOfService>()?,
        None => QualityOfService::default(),
    };
    if parts.next().is_some() {
        return Err(ParseError::Usage("sub <filter> [qos]"));
    }
    Ok(SubscriptionDescriptor::new(filter, qos))
}

fn parse_field_value(rest: &str, usage: &'static str) -> Result<(ConnectionField, String), ParseError> {
    let rest = rest.trim();
    let (field, value) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    if field.is_empty() {
        return Err(ParseError::Usage(usage));
    }
    let field = field.parse::<ConnectionField>()?;
    let value = value.trim().to_string();
    if value.is_empty() && field == ConnectionField::Url {
        return Err(ValidationError::Empty("url").into());
    }
    Ok((field, value))
}

/// Parses one console line. Values are validated here, before any state
/// changes.
pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));

    let command = match word.to_ascii_lowercase().as_str() {
        "connect" => Command::Connect,
        "disconnect" => Command::Disconnect,
        "status" => Command::Status,
        "set" => {
            let (field, value) = parse_field_value(rest, "set <url|client|user|password> <value>")?;
            Command::SetConnection(field, value)
        }
        "reconfigure" => {
            let (field, value) =
                parse_field_value(rest, "reconfigure <url|client|user|password> <value>")?;
            Command::Reconfigure(field, value)
        }
        "topic" => Command::SetTopic(required(rest, "topic <topic>")?),
        // keeps inner whitespace, only the separator after the command is dropped
        "payload" => Command::SetPayload(rest.to_string()),
        "qos" => Command::SetQos(required(rest, "qos <0|1|2>")?.parse()?),
        "retain" => Command::SetRetain(parse_flag(&required(rest, "retain <true|false>")?)?),
        "pub" | "publish" => Command::Publish,
        "clear" => Command::ClearRetained(optional(rest)),
        "sub" | "subscribe" => match optional(rest) {
            Some(rest) => Command::Subscribe(Some(parse_descriptor(&rest)?)),
            None => Command::Subscribe(None),
        },
        "subdraft" => Command::SetSubscribeDraft(parse_descriptor(rest)?),
        "unsub" | "unsubscribe" => Command::Unsubscribe(required(rest, "unsub <filter>")?),
        "topics" => Command::Topics,
        "messages" => match optional(rest) {
            Some(raw) => Command::Messages(
                raw.parse()
                    .map_err(|_| ParseError::Usage("messages [count]"))?,
            ),
            None => Command::Messages(DEFAULT_MESSAGE_COUNT),
        },
        "save" => Command::Save(optional(rest)),
        "switch" => Command::Switch(required(rest, "switch <name>")?),
        "delete" => Command::Delete(required(rest, "delete <name>")?),
        "contexts" => Command::Contexts,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(command)
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Lines(Vec<String>),
    Quit,
}

impl Outcome {
    fn line(text: impl Into<String>) -> Self {
        Outcome::Lines(vec![text.into()])
    }

    fn none() -> Self {
        Outcome::Lines(Vec::new())
    }
}

pub fn render_status(report: &StatusReport) -> Vec<String> {
    let status = &report.status;
    let mut lines = vec![
        format!("context:  {}", report.active_context),
        format!("broker:   {}", report.url),
        format!("state:    {}", status.connection_state),
        format!(
            "messages: {} received, {} sent",
            status.messages_received, status.messages_sent
        ),
    ];
    if let Some(error) = &status.last_error {
        lines.push(format!("error:    {}", error));
    }
    if let Some(ts) = status.last_activity {
        lines.push(format!("activity: {}", ts.format("%Y-%m-%d %H:%M:%S")));
    }
    lines
}

fn storage_outcome<E: fmt::Display>(
    result: Result<bool, E>,
    done: String,
    skipped: String,
) -> Outcome {
    match result {
        Ok(true) => Outcome::line(done),
        Ok(false) => Outcome::line(skipped),
        Err(e) => Outcome::line(format!("storage error: {}", e)),
    }
}

async fn edit_draft(client: &RuntimeClient, edit: DraftEdit) -> Result<Outcome, RuntimeError> {
    client.send(Intent::EditPublishDraft(edit)).await?;
    Ok(Outcome::none())
}

/// Carries out one command against the runtime.
pub async fn execute(client: &RuntimeClient, command: Command) -> Result<Outcome, RuntimeError> {
    let outcome = match command {
        Command::Connect => {
            client.send(Intent::Connect).await?;
            Outcome::none()
        }
        Command::Disconnect => {
            client.send(Intent::Disconnect).await?;
            Outcome::none()
        }
        Command::Status => Outcome::Lines(render_status(&client.status().await?)),
        Command::SetConnection(field, value) => {
            let mut params = client.connection().await?;
            field.apply(&mut params, value);
            match client.update_connection(params).await? {
                Ok(()) => Outcome::line(format!("{} updated", field)),
                Err(e) => Outcome::line(format!("{}; disconnect first or use `reconfigure`", e)),
            }
        }
        Command::Reconfigure(field, value) => {
            let mut params = client.connection().await?;
            field.apply(&mut params, value);
            client.send(Intent::Reconfigure(params)).await?;
            Outcome::line(format!("{} updated, connection closed", field))
        }
        Command::SetTopic(topic) => edit_draft(client, DraftEdit::Topic(topic)).await?,
        Command::SetPayload(payload) => edit_draft(client, DraftEdit::Payload(payload)).await?,
        Command::SetQos(qos) => edit_draft(client, DraftEdit::Qos(qos)).await?,
        Command::SetRetain(retain) => edit_draft(client, DraftEdit::Retain(retain)).await?,
        Command::Publish => {
            client.send(Intent::Publish).await?;
            Outcome::none()
        }
        Command::ClearRetained(topic) => {
            client.send(Intent::ClearRetained { topic }).await?;
            Outcome::none()
        }
        Command::Subscribe(Some(descriptor)) => {
            client.send(Intent::Subscribe(descriptor)).await?;
            Outcome::none()
        }
        Command::Subscribe(None) => {
            client.send(Intent::SubscribeDraft).await?;
            Outcome::none()
        }
        Command::SetSubscribeDraft(descriptor) => {
            client.send(Intent::UpdateSubscribeDraft(descriptor)).await?;
            Outcome::none()
        }
        Command::Unsubscribe(filter) => {
            client.send(Intent::Unsubscribe(filter)).await?;
            Outcome::none()
        }
        Command::Topics => {
            let topics = client.topics().await?;
            if topics.is_empty() {
                Outcome::line("no subscriptions")
            } else {
                Outcome::Lines(
                    topics
                        .iter()
                        .map(|d| format!("{} (QoS {})", d.filter, d.qos))
                        .collect(),
                )
            }
        }
        Command::Messages(count) => {
            let messages = client.recent_messages(count).await?;
            Outcome::Lines(messages.iter().map(|m| m.render()).collect())
        }
        Command::Save(name) => {
            let name = match name {
                Some(name) => name,
                None => client.list_contexts().await?.active,
            };
            let result = client.save_context(name.clone()).await?;
            storage_outcome(result, format!("saved {}", name), "nothing saved".to_string())
        }
        Command::Switch(name) => {
            let result = client.switch_context(name.clone()).await?;
            storage_outcome(result, format!("switched to {}", name), "nothing to switch to".to_string())
        }
        Command::Delete(name) => {
            let result = client.delete_context(name.clone()).await?;
            storage_outcome(result, format!("deleted {}", name), format!("no context named {}", name))
        }
        Command::Contexts => {
            let listing = client.list_contexts().await?;
            let mut lines: Vec<String> = listing
                .names
                .iter()
                .map(|name| {
                    let marker = if *name == listing.active { "*" } else { " " };
                    format!("{} {}", marker, name)
                })
                .collect();
            if !listing.names.contains(&listing.active) {
                lines.push(format!("* {} (unsaved)", listing.active));
            }
            Outcome::Lines(lines)
        }
        Command::Help => Outcome::line(HELP),
        Command::Quit => Outcome::Quit,
    };
    Ok(outcome)
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{}", line);
    }
}

fn describe_transition(previous: ConnectionState, report: &StatusReport) -> Option<String> {
    let state = report.status.connection_state;
    if state == previous {
        return None;
    }
    match (state, &report.status.last_error) {
        (ConnectionState::Errored, Some(error)) => Some(format!("[{}] {}", state, error)),
        _ => Some(format!("[{}] {}", state, report.url)),
    }
}

/// Reads commands from stdin until `quit` or end of input, then stops the
/// runtime.
pub async fn run(mut handle: RuntimeHandle) -> Result<(), RuntimeError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state = handle.status.borrow().status.connection_state;
    let mut messages_open = true;
    let mut status_open = true;

    println!("{}", render_status(&handle.status.borrow()).join("\n"));
    println!("type `help` for commands");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        debug!("Console input closed");
                        break;
                    }
                    Err(e) => {
                        info!("Console input failed: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(command) => match execute(&handle.client, command).await? {
                        Outcome::Lines(output) => print_lines(&output),
                        Outcome::Quit => break,
                    },
                    Err(e) => println!("{}", e),
                }
            }
            message = handle.messages.recv(), if messages_open => {
                match message {
                    Some(message) => println!("< {}", message),
                    None => messages_open = false,
                }
            }
            changed = handle.status.changed(), if status_open => {
                if changed.is_err() {
                    status_open = false;
                    continue;
                }
                let report = handle.status.borrow_and_update().clone();
                if let Some(text) = describe_transition(state, &report) {
                    println!("{}", text);
                }
                state = report.status.connection_state;
            }
        }
    }

    handle.client.send(Intent::Shutdown).await
}
