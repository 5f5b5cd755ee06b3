use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Parse a port list into deduplicated TCP ports (1..=65535), first occurrence order.
///
/// Accepted per line, tokens separated by commas or whitespace:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - comments: everything after `#` is ignored
pub fn parse_port_list(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        for token in line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            if let Some((a, b)) = token.split_once('-') {
                let start = parse_port(a.trim())
                    .with_context(|| format!("line {line_no}: invalid start in range: {a}"))?;
                let end = parse_port(b.trim())
                    .with_context(|| format!("line {line_no}: invalid end in range: {b}"))?;
                if start > end {
                    bail!("line {line_no}: invalid range {start}-{end} (start > end)");
                }
                for p in start..=end {
                    if seen.insert(p) {
                        out.push(p);
                    }
                }
                continue;
            }

            let p = parse_port(token)
                .with_context(|| format!("line {line_no}: invalid port value: {token}"))?;
            if seen.insert(p) {
                out.push(p);
            }
        }
    }

    Ok(out)
}

/// Compress ports into an nmap `-p` argument, e.g. `22,80-82,443`.
pub fn format_port_spec(ports: &[u16]) -> String {
    let mut sorted = ports.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let (mut start, mut end) = (first, first);
    for p in iter {
        if p == end + 1 {
            end = p;
            continue;
        }
        parts.push(render_range(start, end));
        start = p;
        end = p;
    }
    parts.push(render_range(start, end));
    parts.join(",")
}

/// Resolve a `--ports` argument: a file path if one exists, an inline list otherwise.
/// Returns `None` for an empty list so nmap keeps its default port set.
pub fn port_spec_from_arg(arg: &str) -> Result<Option<String>> {
    let path = Path::new(arg);
    let ports = if path.is_file() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read ports file: {}", path.display()))?;
        parse_port_list(&content)?
    } else {
        parse_port_list(arg)?
    };
    if ports.is_empty() {
        return Ok(None);
    }
    Ok(Some(format_port_spec(&ports)))
}

fn render_range(start: u16, end: u16) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}

fn parse_port(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}
