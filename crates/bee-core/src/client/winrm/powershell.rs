// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PowerShell scripts run by the WinRM transport.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDateTime, Utc};
use roxmltree::Document;

use crate::client::{ExecOptions, FileStat};
use crate::error::{Error, Result};
use crate::shell::quote_powershell;

/// Exit code of the stat script for a missing path.
pub const EXIT_NOT_EXISTS: i32 = 2;

/// Budget for one command line, under cmd.exe's 8191-character limit.
const COMMAND_BUDGET: usize = 8000;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Command line running `script` through `powershell.exe -EncodedCommand`.
pub fn encode(script: &str) -> String {
    let utf16: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    format!(
        "powershell.exe -NoProfile -NonInteractive -ExecutionPolicy Bypass -EncodedCommand {}",
        STANDARD.encode(utf16)
    )
}

/// Raw bytes per upload chunk so the append line for `temp` fits the budget.
pub fn chunk_size(temp: &str) -> usize {
    let overhead = append_chunk(temp, &[]).len();
    (COMMAND_BUDGET.saturating_sub(overhead) / 4 * 3).max(3)
}

/// Name of the temporary file holding an upload under `%TEMP%`.
pub fn temp_name() -> String {
    format!("bee-{}.tmp", uuid::Uuid::new_v4())
}

/// Inline PowerShell appending one base64 chunk, as a line, to the
/// temporary file.
pub fn append_chunk(temp: &str, chunk: &[u8]) -> String {
    format!(
        r#"powershell.exe -NoProfile -NonInteractive -Command "Add-Content -Encoding ASCII -LiteralPath (Join-Path $env:TEMP '{}') -Value '{}'""#,
        temp.replace('\'', "''"),
        STANDARD.encode(chunk)
    )
}

/// Decode the temporary file line by line into `remote`.
pub fn restore(temp: &str, remote: &str, mkdir: bool) -> String {
    format!(
        r#"$ErrorActionPreference = 'Stop'
$tmp = Join-Path $env:TEMP {temp}
$dest = {dest}
$dir = Split-Path -Parent $dest
if ({mkdir} -and $dir -and -not (Test-Path -LiteralPath $dir)) {{
    New-Item -ItemType Directory -Force -Path $dir | Out-Null
}}
$out = [System.IO.File]::Create($dest)
try {{
    if (Test-Path -LiteralPath $tmp) {{
        foreach ($line in [System.IO.File]::ReadLines($tmp)) {{
            $line = $line.Trim()
            if ($line) {{
                $bytes = [System.Convert]::FromBase64String($line)
                $out.Write($bytes, 0, $bytes.Length)
            }}
        }}
    }}
}} finally {{
    $out.Close()
}}"#,
        temp = quote_powershell(temp),
        dest = quote_powershell(remote),
        mkdir = if mkdir { "$true" } else { "$false" },
    )
}

/// Remove the temporary file of an upload.
pub fn cleanup(temp: &str) -> String {
    format!(
        "Remove-Item -Force -ErrorAction SilentlyContinue -LiteralPath (Join-Path $env:TEMP {})",
        quote_powershell(temp)
    )
}

pub fn mkdir(path: &str) -> String {
    format!(
        "New-Item -ItemType Directory -Force -Path {} | Out-Null",
        quote_powershell(path)
    )
}

const SELECT_STAT: &str = "Select-Object Name, Mode, Length, \
     @{Name='LastWriteTime';Expression={$_.LastWriteTime.ToString('yyyy/M/dd HH:mm:ss', [System.Globalization.CultureInfo]::InvariantCulture)}} \
     | ConvertTo-Xml -As String -NoTypeInformation";

/// Metadata of one path; exits with [`EXIT_NOT_EXISTS`] when absent.
pub fn stat(path: &str) -> String {
    format!(
        "$p = {}\nif (-not (Test-Path -LiteralPath $p)) {{ exit {} }}\nGet-Item -LiteralPath $p -Force | {}",
        quote_powershell(path),
        EXIT_NOT_EXISTS,
        SELECT_STAT
    )
}

/// Metadata of the entries of a directory.
pub fn list(path: &str) -> String {
    format!(
        "Get-ChildItem -LiteralPath {} -Force | Sort-Object Name | {}",
        quote_powershell(path),
        SELECT_STAT
    )
}

/// Write a file's content to stdout.
pub fn read(path: &str) -> String {
    format!(
        "[Console]::Out.Write((Get-Content -LiteralPath {} -Raw))",
        quote_powershell(path)
    )
}

/// Run a command with arguments, environment and working directory.
pub fn exec(shell: &str, options: &ExecOptions) -> String {
    let mut script = String::new();
    if let Some(root) = &options.root {
        script.push_str(&format!("Set-Location -LiteralPath {}\n", quote_powershell(root)));
    }
    for (key, value) in &options.env {
        script.push_str(&format!("$env:{} = {}\n", key, quote_powershell(value)));
    }
    script.push_str("& ");
    script.push_str(&quote_powershell(shell));
    for arg in &options.args {
        script.push(' ');
        script.push_str(&quote_powershell(arg));
    }
    script.push_str("\nexit $LASTEXITCODE");
    script
}

/// Drop a leading UTF-8 byte order mark.
pub fn strip_bom(data: &[u8]) -> &[u8] {
    data.strip_prefix(UTF8_BOM).unwrap_or(data)
}

/// Parse `ConvertTo-Xml` output of the stat scripts.
pub fn parse_stats(xml: &str) -> Result<Vec<FileStat>> {
    let xml = String::from_utf8_lossy(strip_bom(xml.as_bytes())).into_owned();
    let doc = Document::parse(xml.trim())
        .map_err(|e| Error::Parse(format!("invalid stat output: {}", e)))?;

    let mut stats = Vec::new();
    for object in doc
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "Object")
    {
        let property = |name: &str| {
            object
                .children()
                .find(|n| n.is_element() && n.attribute("Name") == Some(name))
                .and_then(|n| n.text())
                .map(str::trim)
                .unwrap_or("")
        };

        let is_dir = property("Mode").starts_with('d');
        let size = property("Length").parse().unwrap_or(0);
        let mod_time = NaiveDateTime::parse_from_str(property("LastWriteTime"), "%Y/%m/%d %H:%M:%S")
            .map(|t| DateTime::<Utc>::from_naive_utc_and_offset(t, Utc))
            .map_err(|e| Error::Parse(format!("invalid LastWriteTime: {}", e)))?;

        stats.push(FileStat {
            name: property("Name").to_string(),
            is_dir,
            mode: if is_dir { 0o755 } else { 0o644 },
            size,
            mod_time,
        });
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_encode_is_utf16le_base64() {
        let line = encode("dir");
        let encoded = line.rsplit(' ').next().unwrap();
        assert_eq!(STANDARD.decode(encoded).unwrap(), b"d\0i\0r\0");
    }

    #[test]
    fn test_chunk_fits_command_budget() {
        let temp = temp_name();
        let size = chunk_size(&temp);
        assert_eq!(size % 3, 0);
        assert!(append_chunk(&temp, &vec![0u8; size]).len() <= 8000);
    }

    #[test]
    fn test_append_chunk_uses_add_content() {
        let line = append_chunk("bee-1.tmp", b"hi");
        assert!(line.starts_with("powershell.exe "));
        assert!(line.contains("Add-Content -Encoding ASCII -LiteralPath (Join-Path $env:TEMP 'bee-1.tmp')"));
        assert!(line.ends_with("-Value 'aGk='\""));
        assert!(!line.contains('%'));
    }

    #[test]
    fn test_exec_quotes_arguments() {
        let options = ExecOptions {
            args: vec![r"C:\tmp\x y.tengo".into(), "--data=it's".into()],
            env: BTreeMap::new(),
            root: Some(r"C:\work".into()),
        };
        assert_eq!(
            exec(r"C:\bee\bin\tengo.exe", &options),
            "Set-Location -LiteralPath 'C:\\work'\n& 'C:\\bee\\bin\\tengo.exe' 'C:\\tmp\\x y.tengo' '--data=it''s'\nexit $LASTEXITCODE"
        );
    }

    #[test]
    fn test_parse_stats() {
        let xml = "\u{feff}<?xml version=\"1.0\" encoding=\"utf-8\"?>
<Objects>
  <Object>
    <Property Name=\"Name\">modules</Property>
    <Property Name=\"Mode\">d-----</Property>
    <Property />
    <Property Name=\"LastWriteTime\">2024/3/05 14:02:09</Property>
  </Object>
  <Object>
    <Property Name=\"Name\">tengo.exe</Property>
    <Property Name=\"Mode\">-a----</Property>
    <Property Name=\"Length\">4096</Property>
    <Property Name=\"LastWriteTime\">2024/12/25 08:00:00</Property>
  </Object>
</Objects>";

        let stats = parse_stats(xml).unwrap();
        assert_eq!(stats.len(), 2);
        assert!(stats[0].is_dir);
        assert_eq!(stats[0].name, "modules");
        assert_eq!(stats[0].mod_time.to_rfc3339(), "2024-03-05T14:02:09+00:00");
        assert!(!stats[1].is_dir);
        assert_eq!(stats[1].size, 4096);
    }

    #[test]
    fn test_strip_bom() {
        assert_eq!(strip_bom(b"\xEF\xBB\xBFdata"), b"data");
        assert_eq!(strip_bom(b"data"), b"data");
    }
}
