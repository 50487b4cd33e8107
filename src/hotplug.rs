// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Hot-plug Monitor (spec §4.7): a library-global, lazily-started background worker that
//! polls for device arrivals/removals and fans out to registered listeners.
//!
//! Per spec §9's "Global mutable state for hot-plug" design note, this is modeled as exactly one
//! lazily-initialised global ([`std::sync::OnceLock`]) with two independent mutexes — one for
//! `listeners`, one for `devices` — that are never held simultaneously, and whose lifecycle is
//! keyed to the first/last subscription rather than process startup.
//!
//! Of the three worker implementations spec §4.7 allows (OS-notification, USB-library-callback,
//! polling), this crate implements exactly the polling model: a 500ms sweep of
//! [`nusb::list_devices`], which is the one portable across every platform `nusb` itself supports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::identity::{parse_iboot_string, DeviceInfo};
use crate::kis::KisClient;
use crate::usb::{Mode, NusbTransport, UsbTransport, APPLE_VENDOR_ID};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// USB string descriptor index the serial string lives at (matches
/// [`crate::connection`]'s discovery path).
const SERIAL_DESCRIPTOR_INDEX: u8 = 3;

/// Words in a KIS info reply (`sizeof(info) / 4`, spec §4.4), same constant `connection.rs` uses.
const KIS_INFO_REPLY_WORDS: u16 = 64;

/// `handle_add`'s retry budget for KIS devices (spec §4.7): up to 10 attempts, 500ms apart.
const HANDLE_ADD_KIS_RETRIES: u32 = 10;
const HANDLE_ADD_KIS_BACKOFF: Duration = Duration::from_millis(500);

/// A stable identifier for a physical USB port, platform-dependent in the original but modeled
/// here as `nusb`'s bus number + port chain, which is stable across mode transitions on every
/// backend `nusb` supports.
pub type Location = String;

/// One hot-plug event delivered to a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind
{
    Add,
    Remove,
}

/// A device transition dispatched to listeners: which [`Location`] changed, what happened, and
/// the mode observed at the time of the event (the *last* observed mode for `Remove`, per spec §9
/// Open Question 3 — not the fixed `0` the original published before that fix).
///
/// `info` is populated on `Add` with whatever [`handle_add`] managed to read before dispatching
/// (`None` if identification failed outright, e.g. the device vanished mid-read); it is always
/// `None` on `Remove`, since there is nothing left to read from.
#[derive(Debug, Clone)]
pub struct DeviceEvent
{
    pub location: Location,
    pub kind: DeviceEventKind,
    pub mode: Mode,
    pub info: Option<DeviceInfo>,
}

type ListenerId = u64;
type ListenerFn = Box<dyn Fn(&DeviceEvent) + Send + 'static>;

struct TrackedDevice
{
    mode: Mode,
    info: Option<DeviceInfo>,
    alive: bool,
}

struct HotplugState
{
    listeners: Mutex<HashMap<ListenerId, ListenerFn>>,
    devices: Mutex<HashMap<Location, TrackedDevice>>,
    next_listener_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_running: Arc<AtomicBool>,
}

static STATE: OnceLock<HotplugState> = OnceLock::new();

fn state() -> &'static HotplugState
{
    STATE.get_or_init(|| HotplugState {
        listeners: Mutex::new(HashMap::new()),
        devices: Mutex::new(HashMap::new()),
        next_listener_id: AtomicU64::new(0),
        worker: Mutex::new(None),
        worker_running: Arc::new(AtomicBool::new(false)),
    })
}

/// An opaque handle returned by [`subscribe`]; pass it to [`unsubscribe`] to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(ListenerId);

/// Registers a listener. The first subscription starts the background polling worker.
pub fn subscribe(callback: impl Fn(&DeviceEvent) + Send + 'static) -> SubscriptionId
{
    crate::ensure_initialized();

    let state = state();
    let id = state.next_listener_id.fetch_add(1, Ordering::SeqCst);

    let was_empty = {
        let mut listeners = state.listeners.lock().expect("hotplug listeners mutex poisoned");
        let was_empty = listeners.is_empty();
        listeners.insert(id, Box::new(callback));
        was_empty
    };

    if was_empty {
        start_worker(state);
    }

    SubscriptionId(id)
}

/// Removes a listener. Events already in flight may still reach it, but no subsequent sweep will.
/// The last unsubscription stops the worker and frees every tracked device.
pub fn unsubscribe(id: SubscriptionId)
{
    let state = state();
    let now_empty = {
        let mut listeners = state.listeners.lock().expect("hotplug listeners mutex poisoned");
        listeners.remove(&id.0);
        listeners.is_empty()
    };

    if now_empty {
        stop_worker(state);
        state.devices.lock().expect("hotplug devices mutex poisoned").clear();
    }
}

/// Whether the background worker is presently running (for tests and diagnostics).
pub fn worker_is_running() -> bool
{
    state().worker_running.load(Ordering::SeqCst)
}

fn start_worker(state: &'static HotplugState)
{
    let mut worker = state.worker.lock().expect("hotplug worker mutex poisoned");
    if worker.is_some() {
        return;
    }

    state.worker_running.store(true, Ordering::SeqCst);
    let running = state.worker_running.clone();

    *worker = Some(std::thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            poll_once(state);
            std::thread::sleep(POLL_INTERVAL);
        }
    }));
}

fn stop_worker(state: &'static HotplugState)
{
    state.worker_running.store(false, Ordering::SeqCst);
    let handle = state.worker.lock().expect("hotplug worker mutex poisoned").take();
    if let Some(handle) = handle {
        let _ = handle.join();
    }
}

/// One polling sweep: lists attached devices, diffs against `devices`, identifies newly-arrived
/// ones, and dispatches add/remove events. `devices` and `listeners` are never locked at the same
/// time, and identification (which opens the device and may block for seconds on KIS retries)
/// happens with *no* lock held at all — only the cheap diff and the final bookkeeping take the
/// `devices` lock.
fn poll_once(state: &'static HotplugState)
{
    let seen = match nusb::list_devices() {
        Ok(iter) => iter
            .filter(|info| info.vendor_id() == APPLE_VENDOR_ID.0)
            .filter_map(|info| Mode::from_pid(info.product_id()).map(|mode| (location_of(&info), mode, info)))
            .collect::<Vec<_>>(),
        Err(e) => {
            warn!("hotplug poll failed to list devices: {e}");
            return;
        },
    };

    // Phase 1: diff against the tracked set. Collect which locations are genuinely new (and need
    // `handle_add`'s blocking identification step) without holding the lock any longer than the
    // diff itself takes.
    let new_arrivals: Vec<(Location, Mode, nusb::DeviceInfo)> = {
        let mut devices = state.devices.lock().expect("hotplug devices mutex poisoned");

        for device in devices.values_mut() {
            device.alive = false;
        }

        let mut new_arrivals = Vec::new();
        for (location, mode, info) in seen {
            match devices.get_mut(&location) {
                Some(tracked) => {
                    tracked.alive = true;
                    tracked.mode = mode;
                },
                None => new_arrivals.push((location, mode, info)),
            }
        }
        new_arrivals
    };

    // Phase 2: identify each new arrival with no lock held (spec §4.7 `handle_add`).
    let identified: Vec<(Location, Mode, Option<DeviceInfo>)> =
        new_arrivals.into_iter().map(|(location, mode, info)| (location, mode, handle_add(&info, mode))).collect();

    // Phase 3: record the (now-identified) arrivals and any removals, building the event list.
    let events = {
        let mut devices = state.devices.lock().expect("hotplug devices mutex poisoned");

        let mut events = Vec::with_capacity(identified.len());
        for (location, mode, info) in identified {
            devices.insert(location.clone(), TrackedDevice { mode, info: info.clone(), alive: true });
            events.push(DeviceEvent { location, kind: DeviceEventKind::Add, mode, info });
        }

        let removed: Vec<Location> = devices.iter().filter(|(_, d)| !d.alive).map(|(loc, _)| loc.clone()).collect();
        for location in removed {
            // handle_remove publishes the last observed mode (spec §9 Open Question 3), not 0.
            if let Some(tracked) = devices.remove(&location) {
                events.push(DeviceEvent { location, kind: DeviceEventKind::Remove, mode: tracked.mode, info: None });
            }
        }

        events
    };

    if events.is_empty() {
        return;
    }

    let listeners = state.listeners.lock().expect("hotplug listeners mutex poisoned");
    for event in &events {
        debug!("hotplug: {:?} at {}", event.kind, event.location);
        for callback in listeners.values() {
            callback(event);
        }
    }
}

/// `handle_add` (spec §4.7): opens a newly-arrived device just long enough to read its identity,
/// then releases it. For KIS devices this runs the full init + get-info sequence, retrying up to
/// [`HANDLE_ADD_KIS_RETRIES`] times with [`HANDLE_ADD_KIS_BACKOFF`] between attempts, since a
/// freshly-enumerated KIS portal can take a moment to come up. A read failure (device unplugged
/// mid-probe, portal never comes up) is not fatal to the sweep — the device is still tracked and
/// the `Add` event still fires, just with `info: None`.
fn handle_add(info: &nusb::DeviceInfo, mode: Mode) -> Option<DeviceInfo>
{
    let device = match info.open() {
        Ok(d) => d,
        Err(e) => {
            debug!("hotplug: failed to open new device for identification: {e}");
            return None;
        },
    };
    let interface = match device.claim_interface(0) {
        Ok(i) => i,
        Err(e) => {
            debug!("hotplug: failed to claim interface on new device: {e}");
            return None;
        },
    };
    let transport = NusbTransport::new(device, interface);

    if mode.is_kis() {
        for attempt in 0..HANDLE_ADD_KIS_RETRIES {
            let kis = KisClient::new(&transport);
            match kis.init().and_then(|()| kis.get_info(KIS_INFO_REPLY_WORDS)) {
                Ok(mut device_info) => {
                    device_info.pid = Some(info.product_id() as u32);
                    return Some(device_info);
                },
                Err(e) => {
                    debug!("hotplug: KIS identify attempt {}/{HANDLE_ADD_KIS_RETRIES} failed: {e}", attempt + 1);
                    if attempt + 1 < HANDLE_ADD_KIS_RETRIES {
                        std::thread::sleep(HANDLE_ADD_KIS_BACKOFF);
                    }
                },
            }
        }
        return None;
    }

    match transport.get_string_descriptor_ascii(SERIAL_DESCRIPTOR_INDEX) {
        Ok(serial) => match parse_iboot_string(&serial) {
            Ok(mut device_info) => {
                device_info.pid = Some(info.product_id() as u32);
                Some(device_info)
            },
            Err(e) => {
                debug!("hotplug: failed to parse identity string from new device: {e}");
                None
            },
        },
        Err(e) => {
            debug!("hotplug: failed to read serial string from new device: {e}");
            None
        },
    }
}

/// A stable-enough identifier for a physical port: bus number plus, on platforms that expose it,
/// the sysfs device path (which is stable across a mode-transition re-enumeration); elsewhere the
/// device address, which is not quite as stable but is what's available.
fn location_of(info: &nusb::DeviceInfo) -> Location
{
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        format!("{}-{}", info.bus_number(), info.sysfs_path().display())
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        format!("{}-{}", info.bus_number(), info.device_address())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    /// Exercises the pure add/remove-diffing logic independent of the global singleton and real
    /// USB enumeration, since the latter can't be driven deterministically in a unit test.
    fn diff_once(devices: &mut HashMap<Location, TrackedDevice>, seen: &[(Location, Mode)]) -> Vec<DeviceEvent>
    {
        for device in devices.values_mut() {
            device.alive = false;
        }

        let mut events = Vec::new();
        for (location, mode) in seen {
            match devices.get_mut(location) {
                Some(tracked) => {
                    tracked.alive = true;
                    tracked.mode = *mode;
                },
                None => {
                    devices.insert(location.clone(), TrackedDevice { mode: *mode, info: None, alive: true });
                    events.push(DeviceEvent { location: location.clone(), kind: DeviceEventKind::Add, mode: *mode, info: None });
                },
            }
        }

        let removed: Vec<Location> = devices.iter().filter(|(_, d)| !d.alive).map(|(loc, _)| loc.clone()).collect();
        for location in removed {
            if let Some(tracked) = devices.remove(&location) {
                events.push(DeviceEvent { location, kind: DeviceEventKind::Remove, mode: tracked.mode, info: None });
            }
        }
        events
    }

    #[test]
    fn add_then_remove_is_a_prefix_of_add_remove_star()
    {
        let mut devices = HashMap::new();
        let loc = "bus0-port1".to_string();

        let add_events = diff_once(&mut devices, &[(loc.clone(), Mode::Dfu)]);
        assert_eq!(add_events.len(), 1);
        assert_eq!(add_events[0].kind, DeviceEventKind::Add);

        let remove_events = diff_once(&mut devices, &[]);
        assert_eq!(remove_events.len(), 1);
        assert_eq!(remove_events[0].kind, DeviceEventKind::Remove);
    }

    #[test]
    fn remove_publishes_last_observed_mode_not_zero()
    {
        let mut devices = HashMap::new();
        let loc = "bus0-port1".to_string();

        diff_once(&mut devices, &[(loc.clone(), Mode::Recovery2)]);
        let remove_events = diff_once(&mut devices, &[]);

        assert_eq!(remove_events[0].mode, Mode::Recovery2);
    }

    #[test]
    fn steady_state_produces_no_events()
    {
        let mut devices = HashMap::new();
        let loc = "bus0-port1".to_string();

        diff_once(&mut devices, &[(loc.clone(), Mode::Dfu)]);
        let steady = diff_once(&mut devices, &[(loc.clone(), Mode::Dfu)]);

        assert!(steady.is_empty());
    }

    #[test]
    fn subscribe_starts_worker_and_last_unsubscribe_stops_it()
    {
        let a = subscribe(|_event| {});
        assert!(worker_is_running());

        let b = subscribe(|_event| {});
        unsubscribe(a);
        assert!(worker_is_running()); // b is still registered

        unsubscribe(b);
        assert!(!worker_is_running());
    }
}
