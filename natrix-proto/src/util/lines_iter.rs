use std::mem;

use bytes::{Buf, Bytes};

/// Iterate over the CRLF-separated lines of `bytes`
///
/// Chunks share the underlying buffer, nothing is copied. A final
/// chunk without a terminator is yielded as-is; this is how the
/// blank line ending a header block surfaces as an empty chunk.
pub(crate) fn lines_iter(bytes: Bytes) -> LinesIter {
    LinesIter(bytes)
}

pub(crate) struct LinesIter(Bytes);

impl Iterator for LinesIter {
    type Item = Bytes;

    fn next(&mut self) -> Option<Self::Item> {
        if self.0.is_empty() {
            return None;
        }

        Some(match memchr::memmem::find(&self.0, b"\r\n") {
            Some(i) => {
                let chunk = self.0.split_to(i);
                self.0.advance("\r\n".len());
                chunk
            }
            None => mem::take(&mut self.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::lines_iter;

    #[test]
    fn iterates_header_block_lines() {
        let block = Bytes::from_static(b"NATS/1.0\r\nTrace-Id: abcd\r\nSequence: 1\r\n\r\n");
        let lines = lines_iter(block).collect::<Vec<_>>();
        assert_eq!(
            vec![
                Bytes::from_static(b"NATS/1.0"),
                Bytes::from_static(b"Trace-Id: abcd"),
                Bytes::from_static(b"Sequence: 1"),
                Bytes::from_static(b""),
            ],
            lines
        );
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert_eq!(0, lines_iter(Bytes::new()).count());
    }

    #[test]
    fn missing_final_terminator_yields_the_tail() {
        let lines = lines_iter(Bytes::from_static(b"abcd\r\ntail")).collect::<Vec<_>>();
        assert_eq!(
            vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"tail")],
            lines
        );
    }

    #[test]
    fn consecutive_terminators_yield_empty_lines() {
        let lines = lines_iter(Bytes::from_static(b"a\r\n\r\nb\r\n")).collect::<Vec<_>>();
        assert_eq!(
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b""),
                Bytes::from_static(b"b"),
            ],
            lines
        );
    }
}
