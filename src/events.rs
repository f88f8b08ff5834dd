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

//! Event processing: link events to keystrokes.

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::bluetooth::LinkEvent;
use crate::input::{InputInjector, Key, Modifier};
use crate::storage::{EntryKind, History};

/// Command codes carried in COMMAND payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    Enter,
    SelectAll,
    Copy,
    Paste,
    Cut,
    Cancel,
}

impl CommandCode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "ENTER" => Some(Self::Enter),
            "SELECT_ALL" => Some(Self::SelectAll),
            "COPY" => Some(Self::Copy),
            "PASTE" => Some(Self::Paste),
            "CUT" => Some(Self::Cut),
            "CANCEL" => Some(Self::Cancel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enter => "ENTER",
            Self::SelectAll => "SELECT_ALL",
            Self::Copy => "COPY",
            Self::Paste => "PASTE",
            Self::Cut => "CUT",
            Self::Cancel => "CANCEL",
        }
    }

    /// Execute through the injector. CANCEL is deliberately a no-op.
    pub fn execute(&self, injector: &dyn InputInjector) -> Result<()> {
        match self {
            Self::Enter => injector.press_key(Key::Enter),
            Self::SelectAll => injector.key_combo(&[Modifier::Ctrl], Key::A),
            Self::Copy => injector.key_combo(&[Modifier::Ctrl], Key::C),
            Self::Paste => injector.key_combo(&[Modifier::Ctrl], Key::V),
            Self::Cut => injector.key_combo(&[Modifier::Ctrl], Key::X),
            Self::Cancel => Ok(()),
        }
    }
}

/// Routes decoded link events to the input injector and history store.
pub struct EventProcessor {
    injector: Box<dyn InputInjector>,
    history: Option<History>,
    input_enabled: bool,
    /// Word-streaming session currently being typed.
    word_session: Option<String>,
}

impl EventProcessor {
    pub fn new(injector: Box<dyn InputInjector>, history: Option<History>) -> Self {
        Self {
            injector,
            history,
            input_enabled: true,
            word_session: None,
        }
    }

    /// Enable or disable input injection.
    pub fn set_input_enabled(&mut self, enabled: bool) {
        self.input_enabled = enabled;
        info!(
            "Input injection {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn is_input_enabled(&self) -> bool {
        self.input_enabled
    }

    /// Process a single link event.
    pub fn process_event(&mut self, event: LinkEvent) -> Result<()> {
        match event {
            LinkEvent::Text(text) => self.handle_text(&text),
            LinkEvent::Word(word) => self.handle_word(&word.word, &word.session, word.seq),
            LinkEvent::Command(code) => self.handle_command(&code),
            LinkEvent::Connected { peer_device_id } => {
                info!("Device connected: {}", peer_device_id);
                // Stale session state must not block words from the new
                // connection.
                self.word_session = None;
                Ok(())
            }
            LinkEvent::Disconnected => {
                info!("Device disconnected");
                Ok(())
            }
            LinkEvent::PairRequested {
                device_id,
                device_name,
            } => {
                info!(
                    "Pairing requested by: {} ({})",
                    device_name.as_deref().unwrap_or("unknown"),
                    device_id
                );
                // Decision is made by the embedding application.
                Ok(())
            }
            LinkEvent::StateChanged(state) => {
                debug!("Link state changed: {}", state.as_str());
                Ok(())
            }
            LinkEvent::Error(e) => {
                error!("Link error: {}", e);
                Ok(())
            }
        }
    }

    fn handle_text(&mut self, text: &str) -> Result<()> {
        info!("Processing text: {} chars", text.len());

        if let Some(history) = &self.history {
            if let Err(e) = history.append(EntryKind::Text, text) {
                error!("Failed to record history: {}", e);
            }
        }

        if self.input_enabled {
            if let Err(e) = self.injector.type_text(text) {
                error!("Failed to inject text: {}", e);
            }
        } else {
            debug!("Input disabled, ignoring text");
        }

        Ok(())
    }

    fn handle_word(&mut self, word: &str, session: &str, seq: Option<u64>) -> Result<()> {
        debug!("Processing word: '{}' seq={:?} session={}", word.trim(), seq, session);

        if self.word_session.as_deref() != Some(session) {
            debug!("New word session: {}", session);
            self.word_session = Some(session.to_string());
        }

        if let Some(history) = &self.history {
            if let Err(e) = history.append(EntryKind::Text, word.trim()) {
                error!("Failed to record history: {}", e);
            }
        }

        // The word arrives with its trailing space; type it as-is so
        // adjacent words don't glue together.
        if self.input_enabled {
            if let Err(e) = self.injector.type_text(word) {
                error!("Failed to inject word: {}", e);
            }
        }

        Ok(())
    }

    fn handle_command(&mut self, code: &str) -> Result<()> {
        debug!("Processing command: {}", code);

        let Some(command) = CommandCode::parse(code) else {
            warn!("Unknown command: {}", code);
            return Ok(());
        };

        if let Some(history) = &self.history {
            if let Err(e) = history.append(EntryKind::Command, command.as_str()) {
                error!("Failed to record history: {}", e);
            }
        }

        if self.input_enabled {
            if let Err(e) = command.execute(self.injector.as_ref()) {
                error!("Failed to execute command: {}", e);
            }
        } else {
            debug!("Input disabled, ignoring command");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WordPayload;
    use anyhow::Result;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingInjector {
        typed: Arc<Mutex<Vec<String>>>,
        keys: Arc<Mutex<Vec<String>>>,
    }

    impl InputInjector for RecordingInjector {
        fn backend_name(&self) -> &'static str {
            "Recording"
        }

        fn type_text(&self, text: &str) -> Result<()> {
            self.typed.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn press_key(&self, key: Key) -> Result<()> {
            self.keys.lock().unwrap().push(format!("{:?}", key));
            Ok(())
        }

        fn key_combo(&self, modifiers: &[Modifier], key: Key) -> Result<()> {
            self.keys
                .lock()
                .unwrap()
                .push(format!("{:?}+{:?}", modifiers, key));
            Ok(())
        }
    }

    fn processor() -> (EventProcessor, Arc<Mutex<Vec<String>>>, Arc<Mutex<Vec<String>>>) {
        let injector = RecordingInjector::default();
        let typed = injector.typed.clone();
        let keys = injector.keys.clone();
        (EventProcessor::new(Box::new(injector), None), typed, keys)
    }

    #[test]
    fn test_text_is_typed() {
        let (mut processor, typed, _) = processor();
        processor.process_event(LinkEvent::Text("hello".into())).unwrap();
        assert_eq!(*typed.lock().unwrap(), vec!["hello"]);
    }

    #[test]
    fn test_words_concatenate_via_trailing_space() {
        let (mut processor, typed, _) = processor();
        for word in ["zkouška ", "zkouška "] {
            processor
                .process_event(LinkEvent::Word(WordPayload {
                    word: word.into(),
                    session: "s1".into(),
                    seq: None,
                }))
                .unwrap();
        }
        assert_eq!(typed.lock().unwrap().concat(), "zkouška zkouška ");
    }

    #[test]
    fn test_command_mapping() {
        let (mut processor, _, keys) = processor();
        processor.process_event(LinkEvent::Command("ENTER".into())).unwrap();
        processor.process_event(LinkEvent::Command("SELECT_ALL".into())).unwrap();
        processor.process_event(LinkEvent::Command("CANCEL".into())).unwrap();
        processor.process_event(LinkEvent::Command("BOGUS".into())).unwrap();

        let keys = keys.lock().unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], "Enter");
        assert_eq!(keys[1], "[Ctrl]+A");
    }

    #[test]
    fn test_input_gate() {
        let (mut processor, typed, keys) = processor();
        processor.set_input_enabled(false);

        processor.process_event(LinkEvent::Text("hidden".into())).unwrap();
        processor.process_event(LinkEvent::Command("ENTER".into())).unwrap();

        assert!(typed.lock().unwrap().is_empty());
        assert!(keys.lock().unwrap().is_empty());
    }

    #[test]
    fn test_command_code_parse_is_case_insensitive() {
        assert_eq!(CommandCode::parse("enter"), Some(CommandCode::Enter));
        assert_eq!(CommandCode::parse(" SELECT_ALL "), Some(CommandCode::SelectAll));
        assert_eq!(CommandCode::parse("nope"), None);
    }
}
