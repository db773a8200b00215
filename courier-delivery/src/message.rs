//! RFC 5322 message assembly.

use chrono::Utc;

use crate::job::DeliveryJob;

/// Builds the full message text for a job: headers, then a body that
/// is plain text, HTML, or a multipart/alternative of both. All line
/// endings are CRLF.
#[must_use]
pub fn build(job: &DeliveryJob, message_id_domain: &str) -> String {
    let mut out = String::with_capacity(
        512 + job.html_body.as_ref().map_or(0, String::len)
            + job.text_body.as_ref().map_or(0, String::len),
    );

    let from = job.sender_name.as_ref().map_or_else(
        || job.sender.to_string(),
        |name| format!("{} <{}>", encode_display_name(name), job.sender),
    );

    push_header(&mut out, "From", &from);
    push_header(&mut out, "To", &job.recipient.to_string());
    push_header(&mut out, "Subject", &sanitize_header_value(&job.subject));
    push_header(&mut out, "Date", &Utc::now().to_rfc2822());
    push_header(
        &mut out,
        "Message-ID",
        &format!("<{}@{message_id_domain}>", job.id),
    );
    push_header(&mut out, "MIME-Version", "1.0");

    match (&job.html_body, &job.text_body) {
        (Some(html), Some(text)) => {
            let boundary = format!("=_courier_{}", job.id);
            push_header(
                &mut out,
                "Content-Type",
                &format!("multipart/alternative; boundary=\"{boundary}\""),
            );
            out.push_str("\r\n");

            out.push_str(&format!("--{boundary}\r\n"));
            out.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
            push_body(&mut out, text);
            out.push_str(&format!("--{boundary}\r\n"));
            out.push_str("Content-Type: text/html; charset=utf-8\r\n\r\n");
            push_body(&mut out, html);
            out.push_str(&format!("--{boundary}--\r\n"));
        }
        (Some(html), None) => {
            push_header(&mut out, "Content-Type", "text/html; charset=utf-8");
            out.push_str("\r\n");
            push_body(&mut out, html);
        }
        (None, body) => {
            push_header(&mut out, "Content-Type", "text/plain; charset=utf-8");
            out.push_str("\r\n");
            push_body(&mut out, body.as_deref().unwrap_or(""));
        }
    }

    out
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

fn push_body(out: &mut String, body: &str) {
    // Normalize to CRLF without doubling existing carriage returns.
    for line in body.split('\n') {
        out.push_str(line.trim_end_matches('\r'));
        out.push_str("\r\n");
    }
}

/// Strips header-injection vectors from user-supplied values.
fn sanitize_header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

fn encode_display_name(name: &str) -> String {
    let name = sanitize_header_value(name);
    if name.chars().all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '.') {
        name
    } else {
        format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
    }
}
