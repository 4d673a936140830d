//! Hardware vsync clock backed by CoreVideo's display link (macOS).
//!
//! The display link thread receives a `TickSlot` pointer as its user data;
//! the slot outlives the link because the clock owns both.

use super::{ClockState, RefreshClock, TickCallback, TickSlot};
use crate::error::ClockError;
use std::sync::Arc;
use tracing::info;

/// Start/stop primitives of the hardware link behind the clock.
trait LinkControl {
    fn start_link(&mut self, slot: &Arc<TickSlot>) -> Result<(), ClockError>;
    fn stop_link(&mut self);
}

/// Tracks the hardware link separately from the tick slot. A stop issued
/// from inside a tick deactivates the slot while the link keeps firing.
struct LinkDriver<L> {
    link: L,
    link_running: bool,
    slot: Arc<TickSlot>,
}

impl<L: LinkControl> LinkDriver<L> {
    fn new(link: L) -> Self {
        Self {
            link,
            link_running: false,
            slot: Arc::new(TickSlot::new()),
        }
    }

    fn start(&mut self, on_tick: TickCallback) -> Result<(), ClockError> {
        if self.slot.is_active() {
            return Err(ClockError::AlreadyRunning);
        }
        self.halt_link();

        self.slot.install(on_tick);
        if let Err(e) = self.link.start_link(&self.slot) {
            self.slot.deactivate();
            return Err(e);
        }
        self.link_running = true;
        Ok(())
    }

    /// Returns whether the slot or the link was still running.
    fn stop(&mut self) -> bool {
        let was_running = self.slot.is_active() || self.link_running;
        self.halt_link();
        self.slot.deactivate();
        was_running
    }

    fn halt_link(&mut self) {
        if self.link_running {
            self.link.stop_link();
            self.link_running = false;
        }
    }

    fn state(&self) -> ClockState {
        if self.slot.is_active() {
            ClockState::Running
        } else {
            ClockState::Stopped
        }
    }
}

/// Refresh clock firing at the true display refresh rate.
pub struct DisplayLinkClock {
    driver: LinkDriver<NativeLink>,
}

impl DisplayLinkClock {
    pub fn new() -> Self {
        Self {
            driver: LinkDriver::new(NativeLink::default()),
        }
    }
}

impl Default for DisplayLinkClock {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshClock for DisplayLinkClock {
    fn start(&mut self, on_tick: TickCallback) -> Result<(), ClockError> {
        self.driver.start(on_tick)?;
        info!("Display link clock started");
        Ok(())
    }

    fn stop(&mut self) {
        if self.driver.stop() {
            info!("Display link clock stopped");
        }
    }

    fn state(&self) -> ClockState {
        self.driver.state()
    }
}

impl Drop for DisplayLinkClock {
    fn drop(&mut self) {
        self.driver.stop();
    }
}

#[cfg(target_os = "macos")]
mod ffi {
    use super::super::{HostTime, TickSlot};
    use std::ffi::c_void;

    pub type CVDisplayLinkRef = *mut c_void;
    pub type CVReturn = i32;
    pub type CVOptionFlags = u64;

    pub const K_CV_RETURN_SUCCESS: CVReturn = 0;

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct CVSMPTETime {
        pub subframes: i16,
        pub subframe_divisor: i16,
        pub counter: u32,
        pub type_: u32,
        pub flags: u32,
        pub hours: i16,
        pub minutes: i16,
        pub seconds: i16,
        pub frames: i16,
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct CVTimeStamp {
        pub version: u32,
        pub video_time_scale: i32,
        pub video_time: i64,
        pub host_time: u64,
        pub rate_scalar: f64,
        pub video_refresh_period: i64,
        pub smpte_time: CVSMPTETime,
        pub flags: u64,
        pub reserved: u64,
    }

    pub type CVDisplayLinkOutputCallback = extern "C" fn(
        display_link: CVDisplayLinkRef,
        in_now: *const CVTimeStamp,
        in_output_time: *const CVTimeStamp,
        flags_in: CVOptionFlags,
        flags_out: *mut CVOptionFlags,
        context: *mut c_void,
    ) -> CVReturn;

    #[link(name = "CoreVideo", kind = "framework")]
    extern "C" {
        pub fn CVDisplayLinkCreateWithActiveCGDisplays(link_out: *mut CVDisplayLinkRef) -> CVReturn;
        pub fn CVDisplayLinkSetOutputCallback(
            link: CVDisplayLinkRef,
            callback: CVDisplayLinkOutputCallback,
            user_info: *mut c_void,
        ) -> CVReturn;
        pub fn CVDisplayLinkStart(link: CVDisplayLinkRef) -> CVReturn;
        pub fn CVDisplayLinkStop(link: CVDisplayLinkRef) -> CVReturn;
    }

    /// Converts the display's video time into a host timestamp.
    pub fn host_time(stamp: &CVTimeStamp) -> HostTime {
        if stamp.video_time_scale <= 0 {
            return HostTime::ZERO;
        }
        HostTime::from_secs_f64(stamp.video_time as f64 / stamp.video_time_scale as f64)
    }

    pub extern "C" fn output_callback(
        _display_link: CVDisplayLinkRef,
        in_now: *const CVTimeStamp,
        _in_output_time: *const CVTimeStamp,
        _flags_in: CVOptionFlags,
        _flags_out: *mut CVOptionFlags,
        context: *mut c_void,
    ) -> CVReturn {
        if context.is_null() || in_now.is_null() {
            return K_CV_RETURN_SUCCESS;
        }
        // SAFETY: context is the `Arc<TickSlot>` pointer installed in `start`,
        // kept alive by the clock until after the link is stopped and released.
        let slot = unsafe { &*(context as *const TickSlot) };
        // SAFETY: CoreVideo passes a valid timestamp for the duration of the call.
        let now = unsafe { &*in_now };
        slot.fire(host_time(now));
        K_CV_RETURN_SUCCESS
    }
}

/// CoreVideo display link, created on first start and released on drop.
#[cfg(target_os = "macos")]
#[derive(Default)]
struct NativeLink {
    link: Option<ffi::CVDisplayLinkRef>,
}

// SAFETY: the display link handle is only touched through `&mut self`;
// CoreVideo's API is thread safe for start/stop/release.
#[cfg(target_os = "macos")]
unsafe impl Send for NativeLink {}

#[cfg(target_os = "macos")]
impl NativeLink {
    fn create(slot: &Arc<TickSlot>) -> Result<ffi::CVDisplayLinkRef, ClockError> {
        use std::ffi::c_void;

        let mut link: ffi::CVDisplayLinkRef = std::ptr::null_mut();
        // SAFETY: link is a valid out-pointer.
        let status = unsafe { ffi::CVDisplayLinkCreateWithActiveCGDisplays(&mut link) };
        if status != ffi::K_CV_RETURN_SUCCESS || link.is_null() {
            return Err(ClockError::Unavailable(format!(
                "CVDisplayLinkCreateWithActiveCGDisplays returned {}",
                status
            )));
        }
        let context = Arc::as_ptr(slot) as *mut c_void;
        // SAFETY: link is valid and the slot outlives it (see module docs).
        let status =
            unsafe { ffi::CVDisplayLinkSetOutputCallback(link, ffi::output_callback, context) };
        if status != ffi::K_CV_RETURN_SUCCESS {
            // SAFETY: link was created above and is not shared.
            unsafe { core_foundation::base::CFRelease(link as *const c_void) };
            return Err(ClockError::Unavailable(format!(
                "CVDisplayLinkSetOutputCallback returned {}",
                status
            )));
        }
        Ok(link)
    }
}

#[cfg(target_os = "macos")]
impl LinkControl for NativeLink {
    fn start_link(&mut self, slot: &Arc<TickSlot>) -> Result<(), ClockError> {
        let link = match self.link {
            Some(link) => link,
            None => {
                let link = Self::create(slot)?;
                self.link = Some(link);
                link
            }
        };
        // SAFETY: link is a valid display link owned by this clock.
        let status = unsafe { ffi::CVDisplayLinkStart(link) };
        if status != ffi::K_CV_RETURN_SUCCESS {
            return Err(ClockError::Unavailable(format!(
                "CVDisplayLinkStart returned {}",
                status
            )));
        }
        Ok(())
    }

    fn stop_link(&mut self) {
        if let Some(link) = self.link {
            // SAFETY: link is a valid display link owned by this clock.
            unsafe { ffi::CVDisplayLinkStop(link) };
        }
    }
}

#[cfg(target_os = "macos")]
impl Drop for NativeLink {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            // SAFETY: the driver stops the link before dropping it.
            unsafe { core_foundation::base::CFRelease(link as *const std::ffi::c_void) };
        }
    }
}

#[cfg(not(target_os = "macos"))]
#[derive(Default)]
struct NativeLink;

#[cfg(not(target_os = "macos"))]
impl LinkControl for NativeLink {
    fn start_link(&mut self, _slot: &Arc<TickSlot>) -> Result<(), ClockError> {
        Err(ClockError::Unavailable(
            "display link clocks require macOS; use the timer clock".into(),
        ))
    }

    fn stop_link(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HostTime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default, Clone)]
    struct CountingLink {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    impl CountingLink {
        fn starts(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }

        fn stops(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    impl LinkControl for CountingLink {
        fn start_link(&mut self, _slot: &Arc<TickSlot>) -> Result<(), ClockError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop_link(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingLink;

    impl LinkControl for FailingLink {
        fn start_link(&mut self, _slot: &Arc<TickSlot>) -> Result<(), ClockError> {
            Err(ClockError::Unavailable("no display".into()))
        }

        fn stop_link(&mut self) {
            panic!("a link that never started must not be stopped");
        }
    }

    #[test]
    fn test_stop_halts_link_after_stop_from_inside_tick() {
        let link = CountingLink::default();
        let mut driver = LinkDriver::new(link.clone());
        driver.start(Box::new(|_| {})).unwrap();

        // A tick that stops the clock only deactivates the slot.
        driver.slot.deactivate();
        assert_eq!(driver.state(), ClockState::Stopped);
        assert_eq!(link.stops(), 0);

        assert!(driver.stop());
        assert_eq!(link.stops(), 1);
        assert!(!driver.stop());
        assert_eq!(link.stops(), 1);
    }

    #[test]
    fn test_restart_stops_link_left_running() {
        let link = CountingLink::default();
        let mut driver = LinkDriver::new(link.clone());
        driver.start(Box::new(|_| {})).unwrap();
        driver.slot.deactivate();

        driver.start(Box::new(|_| {})).unwrap();
        assert_eq!(link.starts(), 2);
        assert_eq!(link.stops(), 1);
        assert_eq!(driver.state(), ClockState::Running);
    }

    #[test]
    fn test_double_start_leaves_link_alone() {
        let link = CountingLink::default();
        let mut driver = LinkDriver::new(link.clone());
        driver.start(Box::new(|_| {})).unwrap();
        assert!(matches!(
            driver.start(Box::new(|_| {})),
            Err(ClockError::AlreadyRunning)
        ));
        assert_eq!((link.starts(), link.stops()), (1, 0));
    }

    #[test]
    fn test_failed_link_start_leaves_clock_stopped() {
        let mut driver = LinkDriver::new(FailingLink);
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let result = driver.start(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(matches!(result, Err(ClockError::Unavailable(_))));
        assert_eq!(driver.state(), ClockState::Stopped);

        driver.slot.fire(HostTime::ZERO);
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        assert!(!driver.stop());
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_start_fails_without_hardware_clock() {
        let mut clock = DisplayLinkClock::new();
        let result = clock.start(Box::new(|_| {}));
        assert!(matches!(result, Err(ClockError::Unavailable(_))));
        assert_eq!(clock.state(), ClockState::Stopped);
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn test_host_time_from_video_time() {
        use super::ffi::*;

        let smpte = CVSMPTETime {
            subframes: 0,
            subframe_divisor: 0,
            counter: 0,
            type_: 0,
            flags: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
            frames: 0,
        };
        let stamp = CVTimeStamp {
            version: 0,
            video_time_scale: 600,
            video_time: 300,
            host_time: 0,
            rate_scalar: 1.0,
            video_refresh_period: 10,
            smpte_time: smpte,
            flags: 0,
            reserved: 0,
        };
        assert_eq!(host_time(&stamp).as_secs_f64(), 0.5);
    }
}
