//! Llama 3 chat template the adapter was tuned against, plus the reverse
//! direction: pulling the assistant reply and its code block back out of
//! decoded model output.

pub const SYSTEM_PROMPT: &str = "You are a helpful Python programming assistant. Write clear, correct, and well-commented code. Always provide working examples when appropriate.";

const BEGIN_OF_TEXT: &str = "<|begin_of_text|>";
const START_HEADER: &str = "<|start_header_id|>";
const END_HEADER: &str = "<|end_header_id|>";
const END_OF_TURN: &str = "<|eot_id|>";

/// Opens the assistant turn. Everything after its last occurrence is the reply.
pub const ASSISTANT_MARKER: &str = "assistant<|end_header_id|>";

const FENCE: &str = "```";

pub fn build_prompt(user_prompt: &str) -> String {
    format!(
        "{BEGIN_OF_TEXT}{START_HEADER}system{END_HEADER}\n\n{SYSTEM_PROMPT}{END_OF_TURN}\
         {START_HEADER}user{END_HEADER}\n\n{user_prompt}{END_OF_TURN}\
         {START_HEADER}assistant{END_HEADER}\n\n"
    )
}

/// Returns the user text enclosed by the user header and the end-of-turn
/// marker that hands over to the assistant.
pub fn user_segment(templated: &str) -> Option<&str> {
    let header = format!("{START_HEADER}user{END_HEADER}\n\n");
    let closing = format!("{END_OF_TURN}{START_HEADER}assistant{END_HEADER}");
    let start = templated.find(&header)? + header.len();
    let end = templated[start..].rfind(&closing)?;
    Some(&templated[start..start + end])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub reply: String,
    pub code: String,
    pub marker_found: bool,
    pub fenced: bool,
}

/// Splits decoded output on the assistant marker and selects the code.
///
/// Code selection: the first complete fenced block of the reply, with its
/// info string dropped. A reply without a complete fence is returned whole.
pub fn extract(decoded: &str) -> Extraction {
    let (raw_reply, marker_found) = match decoded.rfind(ASSISTANT_MARKER) {
        Some(pos) => (&decoded[pos + ASSISTANT_MARKER.len()..], true),
        None => (decoded, false),
    };
    let reply = strip_special_tokens(raw_reply).trim().to_string();

    let (code, fenced) = match first_fenced_block(&reply) {
        Some(block) => (block.to_string(), true),
        None => (reply.clone(), false),
    };

    Extraction {
        reply,
        code,
        marker_found,
        fenced,
    }
}

pub fn first_fenced_block(text: &str) -> Option<&str> {
    let open = text.find(FENCE)?;
    let after_open = &text[open + FENCE.len()..];
    let close = after_open.find(FENCE)?;
    let inner = &after_open[..close];

    // A lone first line is code even when it looks like a language tag.
    let body = match inner.split_once('\n') {
        Some((info, rest)) if is_info_string(info) && has_code_line(rest) => rest,
        _ => inner,
    };
    Some(body.trim_matches(|c| c == '\n' || c == '\r').trim_end())
}

fn has_code_line(text: &str) -> bool {
    text.lines().any(|line| !line.trim().is_empty())
}

fn is_info_string(line: &str) -> bool {
    let line = line.trim();
    line.is_empty() || (!line.chars().any(char::is_whitespace) && !line.contains('('))
}

/// Removes `<|name|>` control tokens left behind when decoding keeps specials.
pub fn strip_special_tokens(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<|") {
        out.push_str(&rest[..start]);
        let candidate = &rest[start + 2..];
        match candidate.find("|>") {
            Some(end) if is_token_name(&candidate[..end]) => {
                rest = &candidate[end + 2..];
            }
            _ => {
                out.push_str("<|");
                rest = candidate;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_token_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
