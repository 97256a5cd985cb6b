//! Strips terminal mode switches that would hijack the viewer's mouse and focus.
//!
//! Workers toggle mouse reporting with `ESC [ ? Pn ; ... h|l`. Forwarding those
//! to a browser terminal makes it emit escape codes on every click, so the
//! mouse and focus parameters are removed and any other private modes in the
//! same sequence are kept.

const ESC: u8 = 0x1b;

/// Private mode parameters that are always removed.
const STRIPPED_MODES: [u32; 8] = [1000, 1001, 1002, 1003, 1004, 1005, 1006, 1015];

/// Byte-level filter that also turns the stream into UTF-8 text.
#[derive(Debug, Default)]
pub struct EscapeFilter {
    /// Held-back tail: an unfinished escape sequence or a split UTF-8 character.
    pending: Vec<u8>,
}

enum Scan {
    /// Complete private-mode sequence ending at this index (exclusive).
    Complete(usize),
    /// Ran out of input before the sequence finished.
    Partial,
    /// Not a private-mode sequence.
    Other,
}

impl EscapeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter one chunk, returning text that is safe to forward.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(chunk);

        let mut out = Vec::with_capacity(input.len());
        let mut i = 0;
        while i < input.len() {
            if input[i] != ESC {
                out.push(input[i]);
                i += 1;
                continue;
            }
            match scan_private_mode(&input, i) {
                Scan::Complete(end) => {
                    rewrite_private_mode(&input[i..end], &mut out);
                    i = end;
                }
                Scan::Partial => {
                    self.pending.extend_from_slice(&input[i..]);
                    break;
                }
                Scan::Other => {
                    out.push(ESC);
                    i += 1;
                }
            }
        }

        let (text, carry) = decode_utf8(&out);
        if !carry.is_empty() {
            let mut held = carry.to_vec();
            held.append(&mut self.pending);
            self.pending = held;
        }
        text
    }

    /// Release whatever is still held back.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

fn scan_private_mode(input: &[u8], start: usize) -> Scan {
    let prefix = [ESC, b'[', b'?'];
    for (offset, expected) in prefix.iter().enumerate() {
        match input.get(start + offset) {
            None => return Scan::Partial,
            Some(b) if b == expected => {}
            Some(_) => return Scan::Other,
        }
    }
    let mut j = start + prefix.len();
    loop {
        match input.get(j) {
            None => return Scan::Partial,
            Some(b'0'..=b'9' | b';') => j += 1,
            Some(b'h' | b'l') if j > start + prefix.len() => return Scan::Complete(j + 1),
            Some(_) => return Scan::Other,
        }
    }
}

/// Emit `seq` minus the stripped modes and empty parameters; drops it entirely
/// when nothing is left.
fn rewrite_private_mode(seq: &[u8], out: &mut Vec<u8>) {
    let final_byte = seq[seq.len() - 1];
    let params = &seq[3..seq.len() - 1];
    let kept: Vec<&[u8]> = params
        .split(|b| *b == b';')
        .filter(|p| !p.is_empty())
        .filter(|p| {
            let value = std::str::from_utf8(p).ok().and_then(|s| s.parse::<u32>().ok());
            !matches!(value, Some(v) if STRIPPED_MODES.contains(&v))
        })
        .collect();
    if kept.is_empty() {
        return;
    }
    out.extend_from_slice(&[ESC, b'[', b'?']);
    out.extend_from_slice(&kept.join(&b';'));
    out.push(final_byte);
}

/// Decode as much as possible; an incomplete trailing character is returned as carry.
fn decode_utf8(bytes: &[u8]) -> (String, &[u8]) {
    let mut text = String::with_capacity(bytes.len());
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                text.push_str(s);
                return (text, &[]);
            }
            Err(err) => {
                let (valid, after) = rest.split_at(err.valid_up_to());
                // valid_up_to guarantees this prefix decodes.
                text.push_str(&String::from_utf8_lossy(valid));
                match err.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    }
                    None => return (text, after),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_mouse_modes() {
        let mut f = EscapeFilter::new();
        assert_eq!(f.push(b"a\x1b[?1000;1006hb\x1b[?1002lc"), "abc");
    }

    #[test]
    fn keeps_unrelated_private_modes() {
        let mut f = EscapeFilter::new();
        assert_eq!(f.push(b"\x1b[?25l\x1b[?1049h"), "\x1b[?25l\x1b[?1049h");
        assert_eq!(f.push(b"\x1b[?1000;25h"), "\x1b[?25h");
        assert_eq!(f.push(b"\x1b[31mred\x1b[0m"), "\x1b[31mred\x1b[0m");
    }

    #[test]
    fn empty_parameters_are_dropped() {
        let mut f = EscapeFilter::new();
        assert_eq!(f.push(b"\x1b[?;1000;25h"), "\x1b[?25h");
        assert_eq!(f.push(b"\x1b[?;25;l"), "\x1b[?25l");
        assert_eq!(f.push(b"a\x1b[?;1006;hb"), "ab");
        assert_eq!(f.push(b"\x1b[?;h"), "");
    }

    #[test]
    fn holds_back_split_sequence() {
        let mut f = EscapeFilter::new();
        assert_eq!(f.push(b"x\x1b[?10"), "x");
        assert_eq!(f.push(b"04h y"), " y");
        assert_eq!(f.push(b"\x1b"), "");
        assert_eq!(f.push(b"[?1004l"), "");
    }

    #[test]
    fn carries_split_utf8() {
        let mut f = EscapeFilter::new();
        let bytes = "héllo".as_bytes();
        assert_eq!(f.push(&bytes[..2]), "h");
        assert_eq!(f.push(&bytes[2..]), "éllo");
    }

    #[test]
    fn finish_releases_held_bytes() {
        let mut f = EscapeFilter::new();
        assert_eq!(f.push(b"tail\x1b[?"), "tail");
        assert_eq!(f.finish(), "\x1b[?");
    }
}
