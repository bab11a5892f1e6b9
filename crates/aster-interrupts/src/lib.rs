#![forbid(unsafe_code)]

//! Interrupt-line plumbing between device models and the platform interrupt
//! controller.
//!
//! Lines are level wires identified by a small index the device defines.
//! Edge-style notification is expressed as a raise immediately followed by a
//! lower ([`IrqSink::pulse`]).

pub trait IrqSink {
    fn raise(&mut self, line: u32);
    fn lower(&mut self, line: u32);

    fn pulse(&mut self, line: u32) {
        self.raise(line);
        self.lower(line);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqEvent {
    Raise(u32),
    Lower(u32),
}

/// Test sink that records every transition in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Vec<IrqEvent>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_events(&mut self) -> Vec<IrqEvent> {
        std::mem::take(&mut self.events)
    }

    /// Number of raise edges seen on `line` since the last `take_events`.
    pub fn pulses(&self, line: u32) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, IrqEvent::Raise(l) if *l == line))
            .count()
    }
}

impl IrqSink for RecordingSink {
    fn raise(&mut self, line: u32) {
        self.events.push(IrqEvent::Raise(line));
    }

    fn lower(&mut self, line: u32) {
        self.events.push(IrqEvent::Lower(line));
    }
}

/// Sink for platforms that leave a line unwired.
#[derive(Debug, Default)]
pub struct NullSink;

impl IrqSink for NullSink {
    fn raise(&mut self, _line: u32) {}
    fn lower(&mut self, _line: u32) {}
}
