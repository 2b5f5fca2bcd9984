//! Reply composition for a finished execution.

use crate::{ansi_html::ansi_to_html, protocol::ExecResult, sgr, transport::FormattedText};

pub const LINE_LIMIT: usize = 256;
pub const BYTE_LIMIT: usize = 8192;
pub const ELLIPSIS: &str = "[…]";

/// Trim, cap at [`LINE_LIMIT`] lines, then cap at [`BYTE_LIMIT`] bytes.
/// Each cap appends [`ELLIPSIS`] when it fires.
pub fn truncate_stream(text: &str) -> String {
    let mut out = text.trim().to_string();

    if out.split('\n').count() > LINE_LIMIT {
        let mut lines: Vec<&str> = out.split('\n').take(LINE_LIMIT).collect();
        lines.push(ELLIPSIS);
        out = lines.join("\n");
    }

    if out.len() > BYTE_LIMIT {
        let cut = floor_char_boundary(&out, BYTE_LIMIT - ELLIPSIS.len());
        out.truncate(cut);
        out.push_str(ELLIPSIS);
    }

    out
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Nanoseconds as milliseconds rounded to one decimal, ties to even.
pub fn format_duration_ms(duration_ns: u64) -> String {
    let mut tenths = duration_ns / 100_000;
    let rem = duration_ns % 100_000;
    if rem > 50_000 || (rem == 50_000 && tenths % 2 == 1) {
        tenths += 1;
    }
    format!("{}.{}", tenths / 10, tenths % 10)
}

pub fn status_line(result: &ExecResult) -> String {
    let duration = format_duration_ms(result.duration);
    if result.return_code != 0 {
        format!("Exited with code {} in {duration} ms.", result.return_code)
    } else {
        format!("Completed in {duration} ms.")
    }
}

/// Build the reply for a successful execution, or `None` if it would be empty.
pub fn render_result(result: &ExecResult) -> Option<FormattedText> {
    let status = status_line(result);
    let mut body = status.clone();
    let mut html = status;

    if result.timeout {
        body.push_str(" Execution timed out.");
        html.push_str(" <strong>Execution timed out</strong>.");
    }

    for (label, stream) in [("stdout", &result.stdout), ("stderr", &result.stderr)] {
        let truncated = truncate_stream(stream);
        if truncated.is_empty() {
            continue;
        }
        body.push_str(&format!("\n{label}:\n{}\n", sgr::plain_text(&truncated)));
        html.push_str(&format!(
            "<p><strong>{label}:</strong></p><pre><code>{}\n</code></pre>",
            ansi_to_html(&truncated)
        ));
    }

    let body = body.trim().to_string();
    if body.is_empty() {
        return None;
    }
    Some(FormattedText::html(body, html.trim()))
}
