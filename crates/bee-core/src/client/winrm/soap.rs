// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WS-Management envelopes for the Windows remote shell, and parsers for the
//! replies.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use roxmltree::{Document, Node};

use crate::error::{Error, Result};

const NS_ENVELOPE: &str = "http://www.w3.org/2003/05/soap-envelope";
const NS_ADDRESSING: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const NS_WSMAN: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const NS_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";

const RESOURCE_CMD: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_SEND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";

const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";
const STATE_DONE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done";

/// Largest envelope the server is asked to accept.
const MAX_ENVELOPE_SIZE: u32 = 153_600;

/// Escape text for an XML element or attribute.
pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

struct Envelope<'a> {
    endpoint: &'a str,
    action: &'a str,
    shell_id: Option<&'a str>,
    options: &'a [(&'a str, &'a str)],
    timeout_secs: u64,
    body: String,
}

impl Envelope<'_> {
    fn render(&self) -> String {
        let selector = self
            .shell_id
            .map(|id| {
                format!(
                    r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#,
                    xml_escape(id)
                )
            })
            .unwrap_or_default();

        let options = if self.options.is_empty() {
            String::new()
        } else {
            let items: String = self
                .options
                .iter()
                .map(|(name, value)| format!(r#"<w:Option Name="{}">{}</w:Option>"#, name, value))
                .collect();
            format!("<w:OptionSet>{}</w:OptionSet>", items)
        };

        format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<env:Envelope xmlns:env="{env}" xmlns:a="{a}" xmlns:w="{w}" xmlns:rsp="{rsp}">"#,
                "<env:Header>",
                "<a:To>{to}</a:To>",
                r#"<a:ReplyTo><a:Address mustUnderstand="true">{anonymous}</a:Address></a:ReplyTo>"#,
                r#"<w:MaxEnvelopeSize mustUnderstand="true">{max}</w:MaxEnvelopeSize>"#,
                "<a:MessageID>uuid:{id}</a:MessageID>",
                r#"<w:Locale xml:lang="en-US" mustUnderstand="false"/>"#,
                "<w:OperationTimeout>PT{timeout}S</w:OperationTimeout>",
                r#"<w:ResourceURI mustUnderstand="true">{resource}</w:ResourceURI>"#,
                r#"<a:Action mustUnderstand="true">{action}</a:Action>"#,
                "{selector}{options}",
                "</env:Header>",
                "<env:Body>{body}</env:Body>",
                "</env:Envelope>"
            ),
            env = NS_ENVELOPE,
            a = NS_ADDRESSING,
            w = NS_WSMAN,
            rsp = NS_SHELL,
            to = xml_escape(self.endpoint),
            anonymous = ANONYMOUS,
            max = MAX_ENVELOPE_SIZE,
            id = uuid::Uuid::new_v4(),
            timeout = self.timeout_secs,
            resource = RESOURCE_CMD,
            action = self.action,
            selector = selector,
            options = options,
            body = self.body,
        )
    }
}

/// Open a shell with stdin and stdout/stderr streams, UTF-8 code page.
pub fn create_shell(endpoint: &str, timeout_secs: u64) -> String {
    Envelope {
        endpoint,
        action: ACTION_CREATE,
        shell_id: None,
        options: &[("WINRS_NOPROFILE", "FALSE"), ("WINRS_CODEPAGE", "65001")],
        timeout_secs,
        body: "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams>\
               <rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>"
            .to_string(),
    }
    .render()
}

/// Run `command` in an open shell.
pub fn command(endpoint: &str, timeout_secs: u64, shell_id: &str, command: &str) -> String {
    Envelope {
        endpoint,
        action: ACTION_COMMAND,
        shell_id: Some(shell_id),
        options: &[("WINRS_CONSOLEMODE_STDIN", "TRUE"), ("WINRS_SKIP_CMD_SHELL", "FALSE")],
        timeout_secs,
        body: format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            xml_escape(command)
        ),
    }
    .render()
}

/// Feed bytes to a command's stdin; `end` closes it.
pub fn send(
    endpoint: &str,
    timeout_secs: u64,
    shell_id: &str,
    command_id: &str,
    data: &[u8],
    end: bool,
) -> String {
    let end = if end { r#" End="true""# } else { "" };
    Envelope {
        endpoint,
        action: ACTION_SEND,
        shell_id: Some(shell_id),
        options: &[],
        timeout_secs,
        body: format!(
            r#"<rsp:Send><rsp:Stream Name="stdin" CommandId="{}"{}>{}</rsp:Stream></rsp:Send>"#,
            xml_escape(command_id),
            end,
            STANDARD.encode(data)
        ),
    }
    .render()
}

/// Poll a command's output streams.
pub fn receive(endpoint: &str, timeout_secs: u64, shell_id: &str, command_id: &str) -> String {
    Envelope {
        endpoint,
        action: ACTION_RECEIVE,
        shell_id: Some(shell_id),
        options: &[("WSMAN_CMDSHELL_OPTION_KEEPALIVE", "TRUE")],
        timeout_secs,
        body: format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
            xml_escape(command_id)
        ),
    }
    .render()
}

/// Terminate a running command.
pub fn terminate(endpoint: &str, timeout_secs: u64, shell_id: &str, command_id: &str) -> String {
    Envelope {
        endpoint,
        action: ACTION_SIGNAL,
        shell_id: Some(shell_id),
        options: &[],
        timeout_secs,
        body: format!(
            r#"<rsp:Signal CommandId="{}"><rsp:Code>{}</rsp:Code></rsp:Signal>"#,
            xml_escape(command_id),
            SIGNAL_TERMINATE
        ),
    }
    .render()
}

/// Close a shell.
pub fn delete_shell(endpoint: &str, timeout_secs: u64, shell_id: &str) -> String {
    Envelope {
        endpoint,
        action: ACTION_DELETE,
        shell_id: Some(shell_id),
        options: &[],
        timeout_secs,
        body: String::new(),
    }
    .render()
}

// ============================================================================
// Replies
// ============================================================================

fn document(xml: &str) -> Result<Document<'_>> {
    Document::parse(xml).map_err(|e| Error::Parse(format!("invalid WS-Management reply: {}", e)))
}

fn find<'a, 'input>(doc: &'a Document<'input>, name: &str) -> Option<Node<'a, 'input>> {
    doc.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn element_text(xml: &str, name: &str) -> Result<String> {
    let doc = document(xml)?;
    find(&doc, name)
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::Parse(format!("missing {} in WS-Management reply", name)))
}

/// ShellId of a Create reply.
pub fn parse_shell_id(xml: &str) -> Result<String> {
    element_text(xml, "ShellId")
}

/// CommandId of a Command reply.
pub fn parse_command_id(xml: &str) -> Result<String> {
    element_text(xml, "CommandId")
}

/// Output of one Receive round.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Received {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub done: bool,
    pub exit_code: Option<i32>,
}

pub fn parse_receive(xml: &str) -> Result<Received> {
    let doc = document(xml)?;
    let mut received = Received::default();

    for node in doc.descendants().filter(|n| n.is_element()) {
        match node.tag_name().name() {
            "Stream" => {
                let Some(text) = node.text().map(str::trim).filter(|t| !t.is_empty()) else {
                    continue;
                };
                let data = STANDARD
                    .decode(text)
                    .map_err(|e| Error::Parse(format!("invalid stream data: {}", e)))?;
                match node.attribute("Name") {
                    Some("stderr") => received.stderr.extend(data),
                    _ => received.stdout.extend(data),
                }
            }
            "CommandState" => {
                received.done = node.attribute("State") == Some(STATE_DONE);
            }
            "ExitCode" => {
                received.exit_code = node.text().and_then(|t| t.trim().parse().ok());
            }
            _ => {}
        }
    }
    Ok(received)
}

/// A SOAP fault.
#[derive(Debug, PartialEq, Eq)]
pub struct Fault {
    /// The operation timed out waiting for output; polling again is fine.
    pub timed_out: bool,
    pub reason: String,
}

pub fn parse_fault(xml: &str) -> Option<Fault> {
    let doc = Document::parse(xml).ok()?;
    let fault = find(&doc, "Fault")?;

    let timed_out = fault
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "Value")
        .filter_map(|n| n.text())
        .any(|v| v.trim().ends_with("TimedOut"));

    let reason = fault
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "Text")
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .unwrap_or_else(|| "unknown WS-Management fault".to_string());

    Some(Fault { timed_out, reason })
}
