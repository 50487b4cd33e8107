// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Connection Manager (spec §4.5): discovery, mode-aware open, configure/interface selection,
//! and reconnect.

use std::thread;
use std::time::Duration;

use log::debug;

use crate::error::{Error, ErrorKind};
use crate::event::Callbacks;
use crate::identity::{parse_iboot_string, DeviceInfo};
use crate::kis::KisClient;
use crate::usb::{Mode, NusbTransport, UsbTransport, APPLE_VENDOR_ID};

/// USB string descriptor index iBoot/DFU bootloaders use for the serial string on every
/// recognised mode. (There is exactly one such index across the product line; it is not part of
/// the identity string itself, so it has no corresponding tag to parse it back out of.)
const SERIAL_DESCRIPTOR_INDEX: u8 = 3;

/// Words in a KIS info reply (`sizeof(info) / 4`, spec §4.4); the info struct this crate parses
/// out of it is the descriptor-string-plus-nonce layout in [`crate::identity`].
const KIS_INFO_REPLY_WORDS: u16 = 64;

const RECONNECT_ATTEMPTS: u32 = 10;

struct SessionInner
{
    transport: Box<dyn UsbTransport>,
    mode: Mode,
    is_kis: bool,
    device_info: DeviceInfo,
}

/// The live connection to a device (spec §3's "Client session"). `inner` is `None` once closed,
/// which is what makes [`ClientSession::close`] idempotent — a second close is simply a no-op.
pub struct ClientSession
{
    inner: Option<SessionInner>,
    ecid_filter: Option<u64>,
    pub callbacks: Callbacks,
}

impl std::fmt::Debug for ClientSession
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result
    {
        f.debug_struct("ClientSession")
            .field("mode", &self.mode())
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl ClientSession
{
    pub fn is_open(&self) -> bool
    {
        self.inner.is_some()
    }

    pub fn mode(&self) -> Option<Mode>
    {
        self.inner.as_ref().map(|i| i.mode)
    }

    pub fn is_kis(&self) -> bool
    {
        self.inner.as_ref().is_some_and(|i| i.is_kis)
    }

    pub fn device_info(&self) -> Option<&DeviceInfo>
    {
        self.inner.as_ref().map(|i| &i.device_info)
    }

    pub fn transport(&self) -> Option<&dyn UsbTransport>
    {
        self.inner.as_ref().map(|i| i.transport.as_ref())
    }

    /// Opens the first attached, recognised-mode Apple device whose identity matches `ecid`
    /// (`None` accepts any device). See spec §4.5 for the full matching and WTF-special-case rule.
    pub fn open_with_ecid(ecid: Option<u64>) -> Result<Self, Error>
    {
        crate::ensure_initialized();

        let wtf_only = ecid == Some(Mode::WTF as u64);

        let candidates = nusb::list_devices().map_err(|e| ErrorKind::NoDevice.error_from(e))?;
        for info in candidates {
            if info.vendor_id() != APPLE_VENDOR_ID.0 {
                continue;
            }
            let Some(mode) = Mode::from_pid(info.product_id()) else { continue };

            if wtf_only {
                if mode != Mode::Wtf {
                    continue;
                }
            } else if ecid.is_some() && mode == Mode::Wtf {
                // ECID is unreadable in WTF mode; a non-WTF ECID request can never match here.
                continue;
            }

            let device = match info.open() {
                Ok(d) => d,
                Err(e) => {
                    debug!("failed to open candidate device: {e}");
                    continue;
                },
            };
            let interface = device.claim_interface(0).map_err(|e| ErrorKind::UsbInterface.error_from(e))?;
            let transport = NusbTransport::new(device, interface);

            let serial = transport.get_string_descriptor_ascii(SERIAL_DESCRIPTOR_INDEX)?;
            let mut device_info = parse_iboot_string(&serial)?;
            device_info.pid = Some(info.product_id() as u32);

            if !wtf_only {
                if let Some(expected) = ecid {
                    if device_info.ecid != Some(expected) {
                        continue;
                    }
                }
            }

            configure_for_mode(&transport, mode)?;

            let is_kis = mode.is_kis();
            if is_kis {
                let kis = KisClient::new(&transport);
                kis.init()?;
                device_info = kis.get_info(KIS_INFO_REPLY_WORDS)?;
                device_info.pid = Some(info.product_id() as u32);

                // ECID is unknown before the info load completes; re-check it now.
                if !wtf_only {
                    if let Some(expected) = ecid {
                        if device_info.ecid != Some(expected) {
                            continue;
                        }
                    }
                }
            }

            let mut session = Self {
                inner: Some(SessionInner { transport: Box::new(transport), mode, is_kis, device_info }),
                ecid_filter: ecid,
                callbacks: Callbacks::new(),
            };
            session.callbacks.dispatch_connected();
            return Ok(session);
        }

        Err(ErrorKind::NoDevice.error())
    }

    /// Wraps [`Self::open_with_ecid`] in a retry loop with a 1-second back-off between attempts.
    pub fn open_with_ecid_and_attempts(ecid: Option<u64>, attempts: u32) -> Result<Self, Error>
    {
        let attempts = attempts.max(1);
        let mut last_err = ErrorKind::NoDevice.error();

        for attempt in 0..attempts {
            match Self::open_with_ecid(ecid) {
                Ok(session) => return Ok(session),
                Err(e) => {
                    last_err = e;
                    if attempt + 1 < attempts {
                        thread::sleep(Duration::from_secs(1));
                    }
                },
            }
        }

        Err(last_err)
    }

    /// Closes, preserving ECID and all callbacks, then re-opens with 10 attempts (spec §4.5).
    pub fn reconnect(mut self) -> Result<Self, Error>
    {
        let ecid = self.ecid_filter;
        let callbacks = std::mem::take(&mut self.callbacks);
        self.close();

        let mut reopened = Self::open_with_ecid_and_attempts(ecid, RECONNECT_ATTEMPTS)?;
        reopened.callbacks = callbacks;
        Ok(reopened)
    }

    /// Invokes the `disconnected` callback (if any) and drops the transport handle. A session
    /// that is already closed is a no-op, matching the "null input" idempotence in spec §4.5.
    pub fn close(&mut self)
    {
        if self.inner.take().is_some() {
            self.callbacks.dispatch_disconnected();
        }
    }
}

impl Drop for ClientSession
{
    fn drop(&mut self)
    {
        self.close();
    }
}

/// `set_configuration(1)`, then `set_interface(0,0)`, and for Recovery modes 3-4 additionally
/// `set_interface(1,1)` (spec §4.5).
fn configure_for_mode(transport: &dyn UsbTransport, mode: Mode) -> Result<(), Error>
{
    transport.set_configuration(1)?;
    transport.set_interface(0, 0)?;
    if matches!(mode, Mode::Recovery3 | Mode::Recovery4) {
        transport.set_interface(1, 1)?;
    }
    Ok(())
}

#[cfg(test)]
impl ClientSession
{
    /// Test-only constructor that skips USB discovery entirely, for exercising everything past
    /// "a device was matched and opened" against a [`crate::testutil::MockTransport`].
    pub(crate) fn for_test(transport: Box<dyn UsbTransport>, mode: Mode, device_info: DeviceInfo, ecid_filter: Option<u64>) -> Self
    {
        Self { inner: Some(SessionInner { transport, mode, is_kis: mode.is_kis(), device_info }), ecid_filter, callbacks: Callbacks::new() }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::testutil::MockTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn session_with_mode(mode: Mode) -> ClientSession
    {
        ClientSession::for_test(Box::new(MockTransport::new()), mode, DeviceInfo::default(), None)
    }

    #[test]
    fn configure_for_mode_sets_second_interface_only_for_recovery3_and_4()
    {
        let transport = MockTransport::new();
        configure_for_mode(&transport, Mode::Recovery1).unwrap();
        assert_eq!(transport.control_log.borrow().len(), 0); // set_configuration/set_interface are no-ops in the mock

        let transport = MockTransport::new();
        configure_for_mode(&transport, Mode::Recovery3).unwrap();
        // No direct way to observe interface calls on the mock (they're no-ops); this exercises
        // that the call sequence itself doesn't error for either mode.
        let _ = transport;
    }

    #[test]
    fn close_is_idempotent()
    {
        let mut session = session_with_mode(Mode::Dfu);
        let disconnect_calls = Arc::new(AtomicUsize::new(0));
        let d = disconnect_calls.clone();
        session.callbacks.disconnected = Some(Box::new(move || {
            d.fetch_add(1, Ordering::SeqCst);
        }));

        session.close();
        session.close();

        assert_eq!(disconnect_calls.load(Ordering::SeqCst), 1);
        assert!(!session.is_open());
    }

    #[test]
    fn drop_also_closes()
    {
        let disconnect_calls = Arc::new(AtomicUsize::new(0));
        {
            let mut session = session_with_mode(Mode::Dfu);
            let d = disconnect_calls.clone();
            session.callbacks.disconnected = Some(Box::new(move || {
                d.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(disconnect_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wtf_sentinel_disables_ecid_filtering()
    {
        // The sentinel value equals Mode::WTF's pid; the loop in open_with_ecid treats this as
        // "match any WTF-mode device", not as a literal ECID to compare against.
        let wtf_sentinel = Some(Mode::WTF as u64);
        assert_eq!(wtf_sentinel, Some(0x1222));
    }
}
