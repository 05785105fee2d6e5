//! Streaming detection of the sudo sentinels.
//!
//! Output arrives in arbitrary chunks, so a sentinel may be split across two
//! reads. The scanner holds back any trailing bytes that could be the start
//! of a sentinel, and any incomplete UTF-8 sequence, until the next chunk
//! decides them. Everything else is released as text immediately.

/// Prompt string handed to `sudo -p`; never forwarded to callers.
pub const SUDO_PROMPT_SENTINEL: &str = "@@CLUSTER-SSH-SUDO-PROMPT@@";

/// Printed by sudo after a wrong password. Forwarded, then reported.
pub const SUDO_FAILED_SENTINEL: &str = "Sorry, try again.";

const SENTINELS: [(&str, Sentinel); 2] = [
    (SUDO_PROMPT_SENTINEL, Sentinel::Prompt),
    (SUDO_FAILED_SENTINEL, Sentinel::Failed),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sentinel {
    Prompt,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Output(String),
    SudoPrompt,
    SudoFailed,
}

#[derive(Debug, Default)]
pub struct SentinelScanner {
    pending: Vec<u8>,
    swallow_newline: bool,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest suffix of `bytes` that is a proper prefix of a sentinel.
fn partial_sentinel_len(bytes: &[u8]) -> usize {
    SENTINELS
        .iter()
        .filter_map(|(text, _)| {
            let text = text.as_bytes();
            (1..text.len())
                .rev()
                .find(|&k| bytes.ends_with(&text[..k]))
        })
        .max()
        .unwrap_or(0)
}

/// Length of an incomplete UTF-8 sequence at the end of `bytes`.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let b = bytes[i];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = match b {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        let have = bytes.len() - i;
        return if have < needed { have } else { 0 };
    }
    0
}

impl SentinelScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop one newline at the start of the next output: the echo of an
    /// answered password.
    pub fn expect_echo(&mut self) {
        self.swallow_newline = true;
    }

    fn take_text(&mut self, end: usize) -> String {
        let text = String::from_utf8_lossy(&self.pending[..end]).into_owned();
        self.pending.drain(..end);
        text
    }

    /// Returns `false` while it cannot tell yet whether a newline follows.
    fn swallow_echo(&mut self) -> bool {
        if !self.swallow_newline {
            return true;
        }
        match self.pending.as_slice() {
            [] | [b'\r'] => return false,
            [b'\r', b'\n', ..] => {
                self.pending.drain(..2);
            }
            [b'\n', ..] => {
                self.pending.drain(..1);
            }
            _ => {}
        }
        self.swallow_newline = false;
        true
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ScanEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            if !self.swallow_echo() {
                break;
            }

            let earliest = SENTINELS
                .iter()
                .filter_map(|(text, kind)| {
                    find(&self.pending, text.as_bytes()).map(|pos| (pos, text.len(), *kind))
                })
                .min_by_key(|(pos, _, _)| *pos);

            match earliest {
                Some((pos, len, Sentinel::Prompt)) => {
                    if pos > 0 {
                        events.push(ScanEvent::Output(self.take_text(pos)));
                    }
                    self.pending.drain(..len);
                    events.push(ScanEvent::SudoPrompt);
                }
                Some((pos, len, Sentinel::Failed)) => {
                    events.push(ScanEvent::Output(self.take_text(pos + len)));
                    events.push(ScanEvent::SudoFailed);
                }
                None => {
                    let held = partial_sentinel_len(&self.pending);
                    let mut end = self.pending.len() - held;
                    end -= incomplete_utf8_tail(&self.pending[..end]);
                    if end > 0 {
                        events.push(ScanEvent::Output(self.take_text(end)));
                    }
                    break;
                }
            }
        }

        events
    }

    /// Release whatever is still held back.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let end = self.pending.len();
        Some(self.take_text(end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_of(events: &[ScanEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Output(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn feed_all(scanner: &mut SentinelScanner, chunks: &[&[u8]]) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(scanner.feed(chunk));
        }
        if let Some(rest) = scanner.finish() {
            events.push(ScanEvent::Output(rest));
        }
        events
    }

    mod prompt_detection {
        use super::*;

        #[test]
        fn test_prompt_in_one_chunk_is_not_forwarded() {
            let mut scanner = SentinelScanner::new();
            let events = scanner.feed(format!("before{SUDO_PROMPT_SENTINEL}").as_bytes());
            assert_eq!(
                events,
                vec![ScanEvent::Output("before".into()), ScanEvent::SudoPrompt]
            );
        }

        #[test]
        fn test_prompt_split_at_every_position() {
            let stream = format!("[sudo] {SUDO_PROMPT_SENTINEL}");
            let bytes = stream.as_bytes();
            for split in 1..bytes.len() {
                let mut scanner = SentinelScanner::new();
                let first = scanner.feed(&bytes[..split]);
                assert!(
                    !output_of(&first).contains('@'),
                    "sentinel bytes leaked at split {split}: {first:?}"
                );
                let second = scanner.feed(&bytes[split..]);
                let all: Vec<_> = first.into_iter().chain(second).collect();
                assert!(all.contains(&ScanEvent::SudoPrompt), "split {split}");
                assert_eq!(output_of(&all), "[sudo] ");
            }
        }

        #[test]
        fn test_prompt_split_across_three_chunks() {
            let (a, rest) = SUDO_PROMPT_SENTINEL.split_at(4);
            let (b, c) = rest.split_at(10);
            let mut scanner = SentinelScanner::new();
            let events = feed_all(&mut scanner, &[a.as_bytes(), b.as_bytes(), c.as_bytes()]);
            assert_eq!(events, vec![ScanEvent::SudoPrompt]);
        }

        #[test]
        fn test_false_start_is_released() {
            let mut scanner = SentinelScanner::new();
            let first = scanner.feed(b"email me@@");
            assert_eq!(output_of(&first), "email me");
            let second = scanner.feed(b"x.org\n");
            assert_eq!(output_of(&second), "@@x.org\n");
        }
    }

    mod failure_detection {
        use super::*;

        #[test]
        fn test_failure_is_forwarded_and_reported() {
            let mut scanner = SentinelScanner::new();
            let events = scanner.feed(
                format!("\r\n{SUDO_FAILED_SENTINEL}\r\n{SUDO_PROMPT_SENTINEL}").as_bytes(),
            );
            assert_eq!(
                events,
                vec![
                    ScanEvent::Output(format!("\r\n{SUDO_FAILED_SENTINEL}")),
                    ScanEvent::SudoFailed,
                    ScanEvent::Output("\r\n".into()),
                    ScanEvent::SudoPrompt,
                ]
            );
        }

        #[test]
        fn test_failure_split_at_every_position() {
            let stream = format!("x{SUDO_FAILED_SENTINEL}y");
            let bytes = stream.as_bytes();
            for split in 1..bytes.len() {
                let mut scanner = SentinelScanner::new();
                let events = feed_all(&mut scanner, &[&bytes[..split], &bytes[split..]]);
                assert_eq!(
                    events.iter().filter(|e| **e == ScanEvent::SudoFailed).count(),
                    1,
                    "split {split}"
                );
                assert_eq!(output_of(&events), stream);
            }
        }
    }

    mod echo {
        use super::*;

        #[test]
        fn test_echoed_newline_is_dropped_once() {
            let mut scanner = SentinelScanner::new();
            scanner.feed(SUDO_PROMPT_SENTINEL.as_bytes());
            scanner.expect_echo();
            let events = scanner.feed(b"\r\nresult\r\n");
            assert_eq!(output_of(&events), "result\r\n");
        }

        #[test]
        fn test_echo_split_between_cr_and_lf() {
            let mut scanner = SentinelScanner::new();
            scanner.expect_echo();
            assert!(scanner.feed(b"\r").is_empty());
            let events = scanner.feed(b"\nok");
            assert_eq!(output_of(&events), "ok");
        }

        #[test]
        fn test_missing_echo_keeps_output() {
            let mut scanner = SentinelScanner::new();
            scanner.expect_echo();
            let events = scanner.feed(b"ok\n");
            assert_eq!(output_of(&events), "ok\n");
        }
    }

    mod utf8 {
        use super::*;

        #[test]
        fn test_multibyte_char_split_is_not_broken() {
            let text = "größe ✓";
            let bytes = text.as_bytes();
            for split in 1..bytes.len() {
                let mut scanner = SentinelScanner::new();
                let events = feed_all(&mut scanner, &[&bytes[..split], &bytes[split..]]);
                assert_eq!(output_of(&events), text, "split {split}");
                assert!(!output_of(&events).contains('\u{FFFD}'));
            }
        }

        #[test]
        fn test_incomplete_tail_length() {
            assert_eq!(incomplete_utf8_tail(b"abc"), 0);
            assert_eq!(incomplete_utf8_tail(&[b'a', 0xE2, 0x9C]), 2);
            assert_eq!(incomplete_utf8_tail(&[0xE2, 0x9C, 0x93]), 0);
            assert_eq!(incomplete_utf8_tail(&[0xF0]), 1);
        }
    }

    #[test]
    fn test_finish_flushes_held_prefix() {
        let mut scanner = SentinelScanner::new();
        let events = scanner.feed(b"done Sorry");
        assert_eq!(output_of(&events), "done ");
        assert_eq!(scanner.finish(), Some("Sorry".into()));
        assert_eq!(scanner.finish(), None);
    }
}
