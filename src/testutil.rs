// SPDX-License-Identifier: MIT OR Apache-2.0
//! An in-memory [`crate::usb::UsbTransport`] used only by unit tests, so the protocol layers
//! (KIS framing, DFU/Recovery upload, command send/receive) can be exercised without real
//! hardware attached.

#![cfg(test)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{Error, ErrorKind};
use crate::usb::UsbTransport;

/// One scripted exchange: what was expected to be sent, and what to reply with.
#[derive(Debug, Clone)]
pub struct ScriptedControl
{
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub reply: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct MockTransport
{
    control_replies: RefCell<VecDeque<Vec<u8>>>,
    bulk_replies: RefCell<VecDeque<Vec<u8>>>,
    pub control_log: RefCell<Vec<(u8, u8, u16, u16, Vec<u8>)>>,
    pub bulk_log: RefCell<Vec<(u8, Vec<u8>)>>,
    pub fail_next_bulk: RefCell<bool>,
}

impl MockTransport
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn push_control_reply(&self, data: impl Into<Vec<u8>>)
    {
        self.control_replies.borrow_mut().push_back(data.into());
    }

    pub fn push_bulk_reply(&self, data: impl Into<Vec<u8>>)
    {
        self.bulk_replies.borrow_mut().push_back(data.into());
    }
}

impl UsbTransport for MockTransport
{
    fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, Error>
    {
        let is_in = request_type & 0x80 != 0;
        self.control_log.borrow_mut().push((request_type, request, value, index, buf.to_vec()));

        if is_in {
            let reply = self.control_replies.borrow_mut().pop_front().unwrap_or_default();
            let len = reply.len().min(buf.len());
            buf[..len].copy_from_slice(&reply[..len]);
            Ok(len)
        } else {
            Ok(buf.len())
        }
    }

    fn bulk_transfer(&self, endpoint: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize, Error>
    {
        if *self.fail_next_bulk.borrow() {
            *self.fail_next_bulk.borrow_mut() = false;
            return Err(ErrorKind::Pipe.error());
        }

        let is_in = endpoint & 0x80 != 0;
        if is_in {
            let reply = self.bulk_replies.borrow_mut().pop_front().unwrap_or_default();
            let len = reply.len().min(buf.len());
            buf[..len].copy_from_slice(&reply[..len]);
            Ok(len)
        } else {
            self.bulk_log.borrow_mut().push((endpoint, buf.to_vec()));
            Ok(buf.len())
        }
    }

    fn set_configuration(&self, _configuration: u8) -> Result<(), Error>
    {
        Ok(())
    }

    fn set_interface(&self, _interface: u8, _alt: u8) -> Result<(), Error>
    {
        Ok(())
    }

    fn reset(&self) -> Result<(), Error>
    {
        Ok(())
    }

    fn get_string_descriptor_ascii(&self, _index: u8) -> Result<String, Error>
    {
        Ok(String::new())
    }
}
