// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Incremental transcript deduplication.
//!
//! A speech recognizer emits a growing sequence of partial transcripts
//! (each its current best guess at the full utterance) followed by one
//! final. This component turns that stream into at-most-once word deltas:
//! each spoken word crosses the wire once, as early as possible, surviving
//! recognizer rewrites ("Pane jo" -> "Planeo"), repeated identical partials
//! and finals that restate already-transmitted text.
//!
//! Partials are debounced; the transmit step runs on a detached task so a
//! newer partial cancelling the debounce cannot abort an in-flight send.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// Debounce window for partial results.
pub const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(100);

/// Minimum delta length worth transmitting.
pub const MIN_NEW_CHARS: usize = 2;

/// Per-listening-session dedup state.
#[derive(Default)]
struct DedupState {
    /// Most recent partial whose new suffix was transmitted.
    last_sent_text: String,
    /// The exact delta last written to the wire (trimmed).
    last_actually_sent_text: String,
    /// All deltas transmitted this session (trimmed).
    sent_segments: HashSet<String>,
    /// The partial currently in the debounce window.
    pending_text: Option<String>,
}

impl DedupState {
    fn reset(&mut self) {
        self.last_sent_text.clear();
        self.last_actually_sent_text.clear();
        self.sent_segments.clear();
        self.pending_text = None;
    }
}

/// Converts partial/final transcripts into at-most-once word deltas.
///
/// Deltas (with a trailing space, so the receiver can concatenate them
/// directly) are pushed into the channel given at construction; the caller
/// forwards them to the link as TEXT.
pub struct TranscriptDeduper {
    state: Arc<Mutex<DedupState>>,
    deltas: mpsc::Sender<String>,
    debounce: Duration,
    min_new_chars: usize,
    debounce_task: Option<JoinHandle<()>>,
}

impl TranscriptDeduper {
    pub fn new(deltas: mpsc::Sender<String>) -> Self {
        Self::with_timing(deltas, DEBOUNCE_INTERVAL, MIN_NEW_CHARS)
    }

    /// Construct with explicit timing, for tests and tuning.
    pub fn with_timing(
        deltas: mpsc::Sender<String>,
        debounce: Duration,
        min_new_chars: usize,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(DedupState::default())),
            deltas,
            debounce,
            min_new_chars,
            debounce_task: None,
        }
    }

    /// Feed one partial transcript.
    pub async fn on_partial(&mut self, full_text: &str) {
        let full_text = full_text.to_string();

        {
            let state = self.state.lock().await;
            let new_text = diff(
                &full_text,
                &state.last_sent_text,
                &state.sent_segments,
                self.min_new_chars,
            );

            if new_text.chars().count() < self.min_new_chars {
                debug!("Partial adds too little, skipping: {:?}", new_text);
                return;
            }

            let trimmed = new_text.trim();
            if trimmed == state.last_actually_sent_text
                || state.sent_segments.contains(trimmed)
            {
                debug!("Partial delta already sent, skipping: {:?}", trimmed);
                return;
            }
        }

        // Restart the debounce window on every fresh partial.
        if let Some(task) = self.debounce_task.take() {
            task.abort();
        }
        self.state.lock().await.pending_text = Some(full_text.clone());

        let state = self.state.clone();
        let deltas = self.deltas.clone();
        let debounce = self.debounce;
        let min_new_chars = self.min_new_chars;
        self.debounce_task = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            // Detached so a later partial aborting the debounce cannot kill
            // an in-flight transmit.
            tokio::spawn(transmit_partial_delta(
                state,
                deltas,
                full_text,
                min_new_chars,
            ));
        }));
    }

    /// Feed the final transcript. Flushes the remaining delta and resets the
    /// session.
    pub async fn on_final(&mut self, final_text: &str) {
        if let Some(task) = self.debounce_task.take() {
            task.abort();
        }

        let mut state = self.state.lock().await;

        let effective_last_sent = match &state.pending_text {
            Some(pending) if final_text.starts_with(pending.as_str()) => pending.clone(),
            _ => state.last_sent_text.clone(),
        };

        let new_text = diff(
            final_text,
            &effective_last_sent,
            &state.sent_segments,
            self.min_new_chars,
        );
        let outgoing = filter_already_sent_segments(&new_text, &state.sent_segments);

        if !outgoing.is_empty() {
            let _ = self.deltas.send(format!("{} ", outgoing)).await;
        }

        state.reset();
    }

    /// Abandon the session without transmitting anything.
    pub async fn reset(&mut self) {
        if let Some(task) = self.debounce_task.take() {
            task.abort();
        }
        self.state.lock().await.reset();
    }
}

/// Debounced transmit path for a partial. Re-runs the guards: the state may
/// have moved while the window was open.
async fn transmit_partial_delta(
    state: Arc<Mutex<DedupState>>,
    deltas: mpsc::Sender<String>,
    full_text: String,
    min_new_chars: usize,
) {
    let mut state = state.lock().await;

    let new_text = diff(
        &full_text,
        &state.last_sent_text,
        &state.sent_segments,
        min_new_chars,
    );
    if new_text.chars().count() < min_new_chars {
        return;
    }
    let trimmed = new_text.trim().to_string();
    if trimmed == state.last_actually_sent_text || state.sent_segments.contains(&trimmed) {
        return;
    }

    if deltas.send(format!("{} ", trimmed)).await.is_err() {
        return;
    }

    debug!("Transmitted delta: {:?}", trimmed);
    state.sent_segments.insert(trimmed.clone());
    state.last_actually_sent_text = trimmed;
    state.last_sent_text = full_text;
}

/// What `full` adds over `sent`.
fn diff(full: &str, sent: &str, segments: &HashSet<String>, min_new_chars: usize) -> String {
    if sent.is_empty() {
        return full.to_string();
    }
    if full == sent {
        return String::new();
    }
    if let Some(suffix) = full.strip_prefix(sent) {
        return suffix.to_string();
    }

    // Word-level: the recognizer may have rewritten earlier words, so look
    // for the rightmost window of full that still equals the sent words.
    let full_words: Vec<&str> = full.split_whitespace().collect();
    let sent_words: Vec<&str> = sent.split_whitespace().collect();
    if !sent_words.is_empty() && full_words.len() >= sent_words.len() {
        for end in (sent_words.len() - 1..full_words.len()).rev() {
            let start = end + 1 - sent_words.len();
            if full_words[start..=end] == sent_words[..] {
                if end < full_words.len() - 1 {
                    return full_words[end + 1..].join(" ");
                }
                break;
            }
        }
    }

    // Raw substring match, taking the text after the last occurrence.
    if let Some(pos) = full.rfind(sent) {
        return full[pos + sent.len()..].trim_start().to_string();
    }

    // Any previously sent segment found inside full.
    for segment in segments {
        if let Some(pos) = full.rfind(segment.as_str()) {
            let after = full[pos + segment.len()..].trim_start();
            if !after.is_empty() {
                return after.to_string();
            }
        }
    }

    // The partial was rewritten beyond recognition. Only resend wholesale if
    // it grew enough to plausibly contain new words.
    if full.chars().count() > sent.chars().count() + min_new_chars {
        full.to_string()
    } else {
        String::new()
    }
}

/// Strip a leading already-sent segment from a final delta.
///
/// A delta that *equals* a sent segment with nothing after it is a
/// deliberately repeated word ("test test") and must go out unchanged.
fn filter_already_sent_segments(new_text: &str, segments: &HashSet<String>) -> String {
    let trimmed = new_text.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    for segment in segments {
        if trimmed == segment {
            return trimmed.to_string();
        }
        if let Some(rest) = trimmed.strip_prefix(segment.as_str()) {
            let rest = rest.trim_start();
            if !rest.is_empty() {
                return rest.to_string();
            }
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DEBOUNCE: Duration = Duration::from_millis(10);
    // Comfortably past the debounce window plus the detached transmit hop.
    const SETTLE: Duration = Duration::from_millis(60);

    fn deduper() -> (TranscriptDeduper, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(32);
        (
            TranscriptDeduper::with_timing(tx, TEST_DEBOUNCE, MIN_NEW_CHARS),
            rx,
        )
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(delta) = rx.try_recv() {
            out.push(delta);
        }
        out
    }

    #[tokio::test]
    async fn test_single_partial_and_final() {
        let (mut deduper, mut rx) = deduper();

        deduper.on_partial("hello world").await;
        tokio::time::sleep(SETTLE).await;
        deduper.on_final("hello world").await;

        assert_eq!(drain(&mut rx), vec!["hello world ".to_string()]);
    }

    #[tokio::test]
    async fn test_repeated_partial_transmits_once() {
        let (mut deduper, mut rx) = deduper();

        deduper.on_partial("hello world").await;
        tokio::time::sleep(SETTLE).await;
        deduper.on_partial("hello world").await;
        deduper.on_partial("hello world").await;
        tokio::time::sleep(SETTLE).await;

        assert_eq!(drain(&mut rx), vec!["hello world ".to_string()]);
    }

    #[tokio::test]
    async fn test_monotone_prefix_growth() {
        let (mut deduper, mut rx) = deduper();

        deduper.on_partial("hello").await;
        tokio::time::sleep(SETTLE).await;
        deduper.on_partial("hello world").await;
        tokio::time::sleep(SETTLE).await;
        deduper.on_final("hello world how are you").await;

        let deltas = drain(&mut rx);
        assert!(deltas.len() <= 3);
        let joined: String = deltas.concat();
        assert_eq!(joined.split_whitespace().collect::<Vec<_>>().join(" "),
            "hello world how are you");
    }

    #[tokio::test]
    async fn test_repeated_word_is_preserved() {
        let (mut deduper, mut rx) = deduper();

        deduper.on_partial("test").await;
        tokio::time::sleep(SETTLE).await;
        deduper.on_final("test test").await;

        assert_eq!(
            drain(&mut rx),
            vec!["test ".to_string(), "test ".to_string()]
        );
    }

    #[tokio::test]
    async fn test_diacritics_repeated_word() {
        let (mut deduper, mut rx) = deduper();

        deduper.on_partial("zkouška").await;
        tokio::time::sleep(SETTLE).await;
        deduper.on_final("zkouška zkouška").await;

        assert_eq!(
            drain(&mut rx),
            vec!["zkouška ".to_string(), "zkouška ".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rewrite_does_not_duplicate() {
        let (mut deduper, mut rx) = deduper();

        deduper.on_partial("Pane jo").await;
        tokio::time::sleep(SETTLE).await;
        // Recognizer rewrote the utterance without adding words.
        deduper.on_partial("Planeo").await;
        tokio::time::sleep(SETTLE).await;
        deduper.on_final("Planeo").await;

        assert_eq!(drain(&mut rx), vec!["Pane jo ".to_string()]);
    }

    #[tokio::test]
    async fn test_rapid_partials_collapse_into_one_delta() {
        let (mut deduper, mut rx) = deduper();

        // All inside one debounce window: only the last survives.
        deduper.on_partial("hel").await;
        deduper.on_partial("hello").await;
        deduper.on_partial("hello wor").await;
        tokio::time::sleep(SETTLE).await;

        assert_eq!(drain(&mut rx), vec!["hello wor ".to_string()]);
    }

    #[tokio::test]
    async fn test_too_short_delta_skipped() {
        let (mut deduper, mut rx) = deduper();

        deduper.on_partial("a").await;
        tokio::time::sleep(SETTLE).await;

        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_final_without_partials() {
        let (mut deduper, mut rx) = deduper();

        deduper.on_final("straight to final").await;
        assert_eq!(drain(&mut rx), vec!["straight to final ".to_string()]);
    }

    #[tokio::test]
    async fn test_final_resets_session() {
        let (mut deduper, mut rx) = deduper();

        deduper.on_partial("hello").await;
        tokio::time::sleep(SETTLE).await;
        deduper.on_final("hello").await;

        // Same word in a new session is new speech.
        deduper.on_partial("hello").await;
        tokio::time::sleep(SETTLE).await;
        deduper.on_final("hello").await;

        assert_eq!(
            drain(&mut rx),
            vec!["hello ".to_string(), "hello ".to_string()]
        );
    }

    #[tokio::test]
    async fn test_final_restating_sent_text_sends_only_remainder() {
        let (mut deduper, mut rx) = deduper();

        deduper.on_partial("one two").await;
        tokio::time::sleep(SETTLE).await;
        deduper.on_final("one two three").await;

        assert_eq!(
            drain(&mut rx),
            vec!["one two ".to_string(), "three ".to_string()]
        );
    }

    #[test]
    fn test_diff_prefix() {
        let segments = HashSet::new();
        assert_eq!(diff("hello world", "hello", &segments, 2), " world");
        assert_eq!(diff("hello", "", &segments, 2), "hello");
        assert_eq!(diff("hello", "hello", &segments, 2), "");
    }

    #[test]
    fn test_diff_word_window_after_rewrite() {
        let segments = HashSet::new();
        // Earlier words rewritten, sent words still present as a window.
        assert_eq!(
            diff("ahoj hello world again", "hello world", &segments, 2),
            "again"
        );
    }

    #[test]
    fn test_diff_rewrite_without_growth_is_empty() {
        let segments = HashSet::new();
        assert_eq!(diff("Planeo", "Pane jo", &segments, 2), "");
    }

    #[test]
    fn test_filter_repeated_word_carveout() {
        let mut segments = HashSet::new();
        segments.insert("test".to_string());

        // Exact repeat with no remainder goes out unchanged.
        assert_eq!(filter_already_sent_segments("test", &segments), "test");
        // A sent prefix with a remainder is stripped.
        assert_eq!(filter_already_sent_segments("test more", &segments), "more");
        // Untouched text passes through.
        assert_eq!(filter_already_sent_segments("other", &segments), "other");
    }
}
