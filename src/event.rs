// SPDX-License-Identifier: MIT OR Apache-2.0
//! Event callbacks (spec §3, §9 "Callbacks as polymorphic over six event kinds").
//!
//! The original library carries six parallel function-pointer fields, one per event kind, on the
//! client-session struct — and its (un)subscribe switch had fall-through bugs where setting one
//! callback silently overwrote the next. This module replaces both problems with a single `Event`
//! sum type plus one capability object, [`Callbacks`], whose six slots are independent `Option`
//! fields — there is no shared switch statement left to fall through.

/// One dispatched event kind, carrying whatever payload that kind's original callback received.
#[derive(Debug, Clone)]
pub enum Event<'a>
{
    /// Data arrived via [`crate::upload::receive`]. Returning `true` from the handler stops the
    /// receive loop early (matching "callback-returning-nonzero" in spec §4.6.4).
    Received(&'a [u8]),

    /// Upload progress: `(percent, bytes_sent, label)`.
    Progress(u8, usize, &'static str),

    /// A connection attempt in [`crate::connection`] has just succeeded.
    Connected,

    /// About to issue a command via [`crate::upload::send_command`].
    PreCommand(&'a str),

    /// A command via [`crate::upload::send_command`] has just completed.
    PostCommand(&'a str),

    /// The session has just been torn down.
    Disconnected,
}

/// A set of optional event handlers, one slot per [`Event`] variant.
///
/// Each slot is independent: setting one never disturbs another, unlike the original's six
/// parallel C function pointers under one fall-through-prone switch.
#[derive(Default)]
pub struct Callbacks
{
    pub received: Option<Box<dyn FnMut(&[u8]) -> bool + Send>>,
    pub progress: Option<Box<dyn FnMut(u8, usize, &'static str) + Send>>,
    pub connected: Option<Box<dyn FnMut() + Send>>,
    pub pre_command: Option<Box<dyn FnMut(&str) -> bool + Send>>,
    pub post_command: Option<Box<dyn FnMut(&str) + Send>>,
    pub disconnected: Option<Box<dyn FnMut() + Send>>,
}

impl std::fmt::Debug for Callbacks
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result
    {
        f.debug_struct("Callbacks")
            .field("received", &self.received.is_some())
            .field("progress", &self.progress.is_some())
            .field("connected", &self.connected.is_some())
            .field("pre_command", &self.pre_command.is_some())
            .field("post_command", &self.post_command.is_some())
            .field("disconnected", &self.disconnected.is_some())
            .finish()
    }
}

impl Callbacks
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Dispatches a received chunk. Returns whether the receive loop should stop
    /// (`Event::Received`'s handler returning `true`, or no handler registered at all leaving the
    /// loop running).
    pub fn dispatch_received(&mut self, data: &[u8]) -> bool
    {
        self.received.as_mut().map(|f| f(data)).unwrap_or(false)
    }

    pub fn dispatch_progress(&mut self, percent: u8, bytes_sent: usize, label: &'static str)
    {
        if let Some(f) = self.progress.as_mut() {
            f(percent, bytes_sent, label);
        }
    }

    pub fn dispatch_connected(&mut self)
    {
        if let Some(f) = self.connected.as_mut() {
            f();
        }
    }

    /// Returns whether the pre-command handler consumed the command (spec §4.6.1: "if it returns
    /// truthy, treat as consumed success").
    pub fn dispatch_pre_command(&mut self, cmd: &str) -> bool
    {
        self.pre_command.as_mut().map(|f| f(cmd)).unwrap_or(false)
    }

    pub fn dispatch_post_command(&mut self, cmd: &str)
    {
        if let Some(f) = self.post_command.as_mut() {
            f(cmd);
        }
    }

    pub fn dispatch_disconnected(&mut self)
    {
        if let Some(f) = self.disconnected.as_mut() {
            f();
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn setting_one_slot_does_not_disturb_another()
    {
        let mut callbacks = Callbacks::new();
        let connected_calls = Arc::new(AtomicUsize::new(0));
        let c = connected_calls.clone();
        callbacks.connected = Some(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let disconnected_calls = Arc::new(AtomicUsize::new(0));
        let d = disconnected_calls.clone();
        callbacks.disconnected = Some(Box::new(move || {
            d.fetch_add(1, Ordering::SeqCst);
        }));

        callbacks.dispatch_connected();
        assert_eq!(connected_calls.load(Ordering::SeqCst), 1);
        assert_eq!(disconnected_calls.load(Ordering::SeqCst), 0);

        callbacks.dispatch_disconnected();
        assert_eq!(disconnected_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_pre_command_handler_does_not_consume()
    {
        let mut callbacks = Callbacks::new();
        assert!(!callbacks.dispatch_pre_command("reboot"));
    }

    #[test]
    fn pre_command_handler_can_consume_the_command()
    {
        let mut callbacks = Callbacks::new();
        callbacks.pre_command = Some(Box::new(|_cmd| true));
        assert!(callbacks.dispatch_pre_command("reboot"));
    }
}
