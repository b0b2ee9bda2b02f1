use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::callback::CallbackSlot;
use crate::dispatcher::{Dispatcher, MessageHandler};
use crate::known::KnownDevices;
use crate::names::NameRegistry;
use crate::recorder::Recorder;
use crate::timer::TimerQueue;
use crate::transport::{MidiTransport, TransportEvent, TransportSink};
use crate::verifier::{IdentityVerifier, VerifiedHandler, DEFAULT_TIMEOUT};
use crate::{Availability, BackendReport, MessageRecord, PortInfo, Result};

/// Handler for backend errors and warnings.
pub type ReportHandler = dyn Fn(&BackendReport) + Send + Sync;

/// Shared collaborators handed to every device.
#[derive(Clone)]
pub struct DeviceContext {
    pub known: Arc<KnownDevices>,
    pub names: Arc<NameRegistry>,
    /// How long to wait for an identity reply.
    pub timeout: Duration,
    /// Delay between opening and sending the identity request. Only honoured
    /// when a timer is present.
    pub verify_delay: Duration,
    /// Drives delayed verification and timeout sweeps. Without it the
    /// timeout is only noticed when the next message arrives.
    pub timer: Option<Arc<TimerQueue>>,
}

impl DeviceContext {
    pub fn new(known: Arc<KnownDevices>, names: Arc<NameRegistry>) -> Self {
        Self {
            known,
            names,
            timeout: DEFAULT_TIMEOUT,
            verify_delay: Duration::ZERO,
            timer: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_timer(mut self, timer: Arc<TimerQueue>, verify_delay: Duration) -> Self {
        self.timer = Some(timer);
        self.verify_delay = verify_delay;
        self
    }
}

impl Default for DeviceContext {
    fn default() -> Self {
        Self::new(
            Arc::new(KnownDevices::builtin()),
            Arc::new(NameRegistry::new()),
        )
    }
}

struct DeviceCore {
    transport: Box<dyn MidiTransport>,
    verifier: IdentityVerifier,
    recorder: Recorder,
    dispatcher: Dispatcher,
    ports: Mutex<Option<(PortInfo, PortInfo)>>,
    on_error: CallbackSlot<ReportHandler>,
    on_warning: CallbackSlot<ReportHandler>,
    timer: Option<Arc<TimerQueue>>,
    verify_delay: Duration,
}

/// An input/output port pair treated as one controller.
///
/// Incoming traffic is gated on identity verification: the first message
/// (or opening the device) starts the handshake, replies go to the
/// verifier, and once the device is available its three-byte channel
/// messages are recorded and dispatched. Everything else is dropped.
pub struct Device {
    core: Arc<DeviceCore>,
}

impl Device {
    pub fn new(transport: Box<dyn MidiTransport>, ctx: &DeviceContext) -> Self {
        let verifier =
            IdentityVerifier::new(Arc::clone(&ctx.known), Arc::clone(&ctx.names), ctx.timeout);
        Self {
            core: Arc::new(DeviceCore {
                transport,
                verifier,
                recorder: Recorder::new(),
                dispatcher: Dispatcher::new(),
                ports: Mutex::new(None),
                on_error: CallbackSlot::new(),
                on_warning: CallbackSlot::new(),
                timer: ctx.timer.clone(),
                verify_delay: ctx.verify_delay,
            }),
        }
    }

    /// Connect to the given ports. Verification starts if the device has
    /// never been checked; reopening a verified device keeps its status.
    pub fn open(&self, input: PortInfo, output: PortInfo) -> Result<()> {
        if self.core.transport.is_open() {
            self.core.transport.close();
        }
        let weak: Weak<DeviceCore> = Arc::downgrade(&self.core);
        let sink: TransportSink = Arc::new(move |event: TransportEvent<'_>| {
            if let Some(core) = weak.upgrade() {
                core.handle_event(event);
            }
        });
        self.core.transport.open(&input, &output, sink)?;
        debug!(input = %input.name, output = %output.name, "device opened");
        *self.core.ports.lock() = Some((input, output));

        if self.core.verifier.status() == Availability::NotChecked {
            self.core.schedule_verification();
        }
        Ok(())
    }

    pub fn close(&self) {
        self.core.transport.close();
    }

    pub fn is_open(&self) -> bool {
        self.core.transport.is_open()
    }

    /// Send raw bytes to the device's output port.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        self.core.transport.send(bytes)
    }

    pub fn start_recording(&self) {
        self.core.recorder.start();
    }

    pub fn stop_recording(&self) {
        self.core.recorder.stop();
    }

    pub fn clear_recording(&self) {
        self.core.recorder.clear();
    }

    pub fn is_recording(&self) -> bool {
        self.core.recorder.is_recording()
    }

    pub fn recorded(&self) -> Vec<MessageRecord> {
        self.core.recorder.recorded()
    }

    /// Register the handler for verified channel messages.
    pub fn on_message(&self, handler: Arc<MessageHandler>) {
        self.core.dispatcher.on_message(handler);
    }

    /// Register the handler for verification outcomes.
    pub fn on_verified(&self, handler: Arc<VerifiedHandler>) {
        self.core.verifier.on_verified(handler);
    }

    pub fn on_error(&self, handler: Arc<ReportHandler>) {
        self.core.on_error.set(handler);
    }

    pub fn on_warning(&self, handler: Arc<ReportHandler>) {
        self.core.on_warning.set(handler);
    }

    pub fn status(&self) -> Availability {
        self.core.verifier.status()
    }

    pub fn identity(&self) -> Vec<u8> {
        self.core.verifier.identity()
    }

    pub fn name(&self) -> String {
        self.core.verifier.name()
    }

    pub fn display_name(&self) -> String {
        self.core.verifier.display_name()
    }

    pub fn in_port(&self) -> Option<PortInfo> {
        self.core.ports.lock().as_ref().map(|(input, _)| input.clone())
    }

    pub fn out_port(&self) -> Option<PortInfo> {
        self.core.ports.lock().as_ref().map(|(_, output)| output.clone())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.core.transport.close();
    }
}

impl DeviceCore {
    fn handle_event(self: &Arc<Self>, event: TransportEvent<'_>) {
        match event {
            TransportEvent::Message(bytes) => self.handle_message(bytes),
            TransportEvent::Error(report) => {
                error!(%report, "transport error");
                if let Some(handler) = self.on_error.get() {
                    handler(&report);
                }
            }
            TransportEvent::Warning(report) => {
                warn!(%report, "transport warning");
                if let Some(handler) = self.on_warning.get() {
                    handler(&report);
                }
            }
        }
    }

    fn handle_message(self: &Arc<Self>, bytes: &[u8]) {
        match self.verifier.status() {
            Availability::NotChecked => self.start_verification(),
            Availability::InProgress => {
                self.verifier.handle(bytes);
            }
            Availability::Available => {
                // Only channel voice traffic is user facing.
                if bytes.len() == 3 {
                    if self.recorder.is_recording() {
                        self.recorder.add(bytes);
                    }
                    self.dispatcher.dispatch(bytes);
                }
            }
            Availability::Unavailable | Availability::TimedOut => {}
        }
    }

    fn schedule_verification(self: &Arc<Self>) {
        match &self.timer {
            Some(timer) if !self.verify_delay.is_zero() => {
                let weak = Arc::downgrade(self);
                timer.schedule_after(self.verify_delay, move || {
                    if let Some(core) = weak.upgrade() {
                        core.start_verification();
                    }
                });
            }
            _ => self.start_verification(),
        }
    }

    fn start_verification(self: &Arc<Self>) {
        if !self.verifier.verify(self.transport.as_ref()) {
            return;
        }
        if let Some(timer) = &self.timer {
            let weak = Arc::downgrade(self);
            timer.schedule_after(self.verifier.timeout(), move || {
                if let Some(core) = weak.upgrade() {
                    core.verifier.expire();
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_virtual::{VirtualBackend, VirtualPeer, LAUNCHPAD_PRO_IDENTITY};
    use crate::transport::MidiBackend;

    fn launchpad(backend: &VirtualBackend) -> (PortInfo, PortInfo) {
        backend.plug(VirtualPeer::new("Launchpad Pro").with_identity(&LAUNCHPAD_PRO_IDENTITY))
    }

    #[test]
    fn opening_verifies_and_dispatches_channel_messages() {
        let backend = VirtualBackend::new();
        let (input, output) = launchpad(&backend);
        let device = Device::new(backend.transport(), &DeviceContext::default());

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        device.on_message(Arc::new(move |bytes: &[u8]| sink.lock().push(bytes.to_vec())));

        device.open(input.clone(), output).unwrap();
        assert_eq!(device.status(), Availability::Available);
        assert_eq!(device.display_name(), "Novation Launchpad Pro");
        assert_eq!(device.in_port(), Some(input.clone()));

        backend.inject(&input.name, &[0x90, 60, 127]);
        backend.inject(&input.name, &[0xF0, 0x00, 0x20, 0x29, 0xF7]);
        backend.inject(&input.name, &[0xC0, 5]);
        assert_eq!(received.lock().as_slice(), &[vec![0x90, 60, 127]]);
    }

    #[test]
    fn recording_only_captures_while_active() {
        let backend = VirtualBackend::new();
        let (input, output) = launchpad(&backend);
        let device = Device::new(backend.transport(), &DeviceContext::default());
        device.open(input.clone(), output).unwrap();

        backend.inject(&input.name, &[0x90, 60, 127]);
        device.start_recording();
        backend.inject(&input.name, &[0x90, 62, 127]);
        device.stop_recording();
        backend.inject(&input.name, &[0x90, 64, 127]);

        let recorded = device.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].bytes.as_slice(), &[0x90, 62, 127]);
    }

    #[test]
    fn silent_device_stays_in_progress_without_timer() {
        let backend = VirtualBackend::new();
        let (input, output) = backend.plug(VirtualPeer::new("Mute Box"));
        let device = Device::new(
            backend.transport(),
            &DeviceContext::default().with_timeout(Duration::from_millis(10)),
        );
        device.open(input.clone(), output).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(device.status(), Availability::InProgress);

        backend.inject(&input.name, &[0x90, 60, 127]);
        assert_eq!(device.status(), Availability::TimedOut);
    }

    #[test]
    fn timer_sweeps_silent_device() {
        let backend = VirtualBackend::new();
        let (input, output) = backend.plug(VirtualPeer::new("Mute Box"));
        let timer = Arc::new(TimerQueue::new().unwrap());
        let ctx = DeviceContext::default()
            .with_timeout(Duration::from_millis(20))
            .with_timer(timer, Duration::ZERO);
        let device = Device::new(backend.transport(), &ctx);

        let (tx, rx) = crossbeam_channel::unbounded();
        device.on_verified(Arc::new(move |_: &[u8], status: Availability| {
            let _ = tx.send(status);
        }));
        device.open(input, output).unwrap();

        let status = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(status, Availability::TimedOut);
    }

    #[test]
    fn delayed_verification_waits_for_timer() {
        let backend = VirtualBackend::new();
        let (input, output) = launchpad(&backend);
        let timer = Arc::new(TimerQueue::new().unwrap());
        let ctx = DeviceContext::default().with_timer(timer, Duration::from_millis(30));
        let device = Device::new(backend.transport(), &ctx);

        let (tx, rx) = crossbeam_channel::unbounded();
        device.on_verified(Arc::new(move |_: &[u8], status: Availability| {
            let _ = tx.send(status);
        }));
        device.open(input, output).unwrap();
        assert_eq!(device.status(), Availability::NotChecked);

        let status = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(status, Availability::Available);
    }

    #[test]
    fn reopen_does_not_reverify() {
        let backend = VirtualBackend::new();
        let (input, output) = launchpad(&backend);
        let device = Device::new(backend.transport(), &DeviceContext::default());
        device.open(input.clone(), output.clone()).unwrap();
        device.close();
        assert!(!device.is_open());

        device.open(input, output.clone()).unwrap();
        assert_eq!(device.status(), Availability::Available);
        assert_eq!(backend.sent(&output.name).len(), 1);
    }

    #[test]
    fn transport_reports_reach_handlers() {
        let backend = VirtualBackend::new();
        let (input, output) = launchpad(&backend);
        let device = Device::new(backend.transport(), &DeviceContext::default());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        device.on_error(Arc::new(move |report: &BackendReport| {
            sink.lock().push(report.message.clone())
        }));
        device.open(input.clone(), output).unwrap();

        backend.report_error(&input.name, "buffer overrun");
        assert_eq!(errors.lock().as_slice(), &["buffer overrun".to_owned()]);
    }
}
