use std::array;

use bytes::{Buf, Bytes};

pub(crate) fn split_spaces(mut bytes: Bytes) -> impl Iterator<Item = Bytes> {
    let mut chunks = array::from_fn::<_, 6, _>(|_| Bytes::new());
    let mut found = 0;

    for chunk in &mut chunks {
        let Some(i) = memchr::memchr2(b' ', b'\t', &bytes) else {
            if !bytes.is_empty() {
                *chunk = bytes;
                found += 1;
            }
            break;
        };

        *chunk = bytes.split_to(i);
        found += 1;

        let spaces = bytes
            .iter()
            .take_while(|b| matches!(b, b' ' | b'\t'))
            .count();
        bytes.advance(spaces);
    }

    chunks.into_iter().take(found)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::split_spaces;

    #[test]
    fn splits_on_runs_of_whitespace() {
        let chunks = split_spaces(Bytes::from_static(b"greet  1 \t_INBOX.x 5"))
            .collect::<Vec<_>>();
        assert_eq!(
            vec![
                Bytes::from_static(b"greet"),
                Bytes::from_static(b"1"),
                Bytes::from_static(b"_INBOX.x"),
                Bytes::from_static(b"5"),
            ],
            chunks
        );
    }
}
