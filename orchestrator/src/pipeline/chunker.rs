//! Coalesces small writes into bounded slices for subscribers.

/// Text buffer that releases fixed-size slices once it fills up.
#[derive(Debug)]
pub struct OutputBuffer {
    buf: String,
    threshold: usize,
}

impl OutputBuffer {
    pub fn new(threshold: usize) -> Self {
        Self {
            buf: String::new(),
            threshold: threshold.max(1),
        }
    }

    /// Append `text`; returns full slices if the threshold was reached.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buf.push_str(text);
        let mut slices = Vec::new();
        while self.buf.len() >= self.threshold {
            let mut cut = self.threshold;
            while !self.buf.is_char_boundary(cut) {
                cut -= 1;
            }
            if cut == 0 {
                // A single character wider than the threshold.
                cut = self.buf.chars().next().map_or(self.buf.len(), char::len_utf8);
            }
            let rest = self.buf.split_off(cut);
            slices.push(std::mem::replace(&mut self.buf, rest));
        }
        slices
    }

    /// Remainder below the threshold, if any.
    pub fn take(&mut self) -> Option<String> {
        (!self.buf.is_empty()).then(|| std::mem::take(&mut self.buf))
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_writes_stay_buffered() {
        let mut b = OutputBuffer::new(8);
        assert!(b.push("abc").is_empty());
        assert!(b.push("de").is_empty());
        assert_eq!(b.take().as_deref(), Some("abcde"));
        assert!(b.take().is_none());
    }

    #[test]
    fn emits_fixed_slices_and_keeps_remainder() {
        let mut b = OutputBuffer::new(4);
        assert_eq!(b.push("abcdefghij"), vec!["abcd", "efgh"]);
        assert_eq!(b.take().as_deref(), Some("ij"));
    }

    #[test]
    fn slices_end_on_char_boundaries() {
        let mut b = OutputBuffer::new(4);
        let slices = b.push("aéééb");
        assert_eq!(slices, vec!["aé", "éé"]);
        assert_eq!(b.take().as_deref(), Some("b"));
    }
}
