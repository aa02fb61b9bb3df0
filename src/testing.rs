//! Test doubles shared by the unit tests

use std::io;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::protocol::{Correlator, PendingCommand};
use crate::registry::CommandSink;
use crate::transport::Transport;

/// Command sink that records command text without a transport
#[derive(Default)]
pub struct RecordingSink {
    commands: Mutex<Vec<String>>,
    correlator: Correlator,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the recorded commands
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.commands.lock().unwrap())
    }
}

impl CommandSink for RecordingSink {
    fn send_command(&self, command: &str) -> Result<PendingCommand> {
        self.commands.lock().unwrap().push(command.to_string());
        let id = self.correlator.next_id();
        Ok(self.correlator.track(id, command))
    }
}

/// Transport that records every written frame
#[derive(Default, Clone)]
pub struct RecordingTransport {
    written: Arc<Mutex<Vec<String>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the written frames
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.written.lock().unwrap())
    }

    /// Drain the written frames with the xapi correlation tag stripped
    pub fn take_commands(&self) -> Vec<String> {
        self.take()
            .into_iter()
            .map(|line| match line.rfind(" | resultId=") {
                Some(idx) => line[..idx].to_string(),
                None => line.trim_end().to_string(),
            })
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, text: &str) -> io::Result<()> {
        self.written.lock().unwrap().push(text.to_string());
        Ok(())
    }
}
