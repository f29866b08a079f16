//! Implements basic messaging across HID and HID++ channels.
//!
//! This includes mapping incoming messages to previously sent requests.

use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::{FutureExt, channel::oneshot, select};
use hidreport::{Field, Report as _, ReportDescriptor, Usage, UsageId, UsagePage};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::{
    codec::CodecError,
    config::ChannelConfig,
    dispatch::{Dispatcher, Expectation, Received, queue::DispatchError},
    feature::registry::SchemaError,
    nibble::U4,
    protocol::error::DeviceError,
    report::{
        FrameError,
        LONG_REPORT_ID,
        MAX_REPORT_LENGTH,
        Report,
        ReportHeader,
        ReportKind,
        SHORT_REPORT_ID,
        VERY_LONG_REPORT_ID,
        VLP_NORMAL_REPORT_ID,
    },
    vlp::{self, VlpError},
};

/// hidapi defines this as the maximum EXPECTED size of report descriptors.
/// We will trust this for now, but a workaround may be required if devices do
/// in fact return longer descriptors.
const MAX_REPORT_DESCRIPTOR_LENGTH: usize = 4096;

const HIDPP_USAGE_PAGE: u16 = 0xff00;
const SHORT_REPORT_USAGE: u16 = 0x0001;
const LONG_REPORT_USAGE: u16 = 0x0002;
const VERY_LONG_REPORT_USAGE: u16 = 0x0004;

/// How often waiters and VLP transfers are checked for expiry.
const HOUSEKEEPING_TICK: Duration = Duration::from_millis(10);

/// Represents an arbitrary HID communication channel that is both readable and
/// writable. It has to support async I/O.
///
/// Any type this trait is implemented for can be used for HID(++)
/// communication. If a specific channel supports HID++ is determined at a later
/// stage and is not directly related to potential implementations of this
/// trait.
#[async_trait]
pub trait RawHidChannel: Send + Sync + 'static {
    /// The USB vendor ID of the device.
    fn vendor_id(&self) -> u16;

    /// The USB product ID of the device.
    fn product_id(&self) -> u16;

    /// Writes a raw report to the channel.
    ///
    /// Returns the exact amount of written bytes on success.
    async fn write_report(&self, src: &[u8]) -> Result<usize, Box<dyn Error + Sync + Send>>;

    /// Reads a raw report from the channel.
    ///
    /// If the buffer is not large enough to fit the whole report, its remainder
    /// should be discarded and must not be returned by any succeeding call to
    /// [`Self::read_report`].
    ///
    /// Returns the exact amount or read bytes on success.
    async fn read_report(&self, buf: &mut [u8]) -> Result<usize, Box<dyn Error + Sync + Send>>;

    /// If the implementation already knows which HID++ reports the underlying
    /// HID channel supports, it should return them from this method.
    ///
    /// In this case, the report descriptor will not be read and parsed.
    fn report_support(&self) -> Option<ReportSupport>;

    /// Retrieves the raw HID report descriptor from the channel.
    ///
    /// This is used to determine whether the channel supports HID++.
    ///
    /// Returns the exact size of the report descriptor on success.
    async fn get_report_descriptor(
        &self,
        buf: &mut [u8],
    ) -> Result<usize, Box<dyn Error + Sync + Send>>;

    /// Whether an error returned by this channel is expected to go away, like
    /// a broken pipe while the device resets.
    ///
    /// Writes failing transiently are retried, reads failing transiently do
    /// not stop the channel.
    fn is_transient(&self, err: &(dyn Error + Sync + Send)) -> bool {
        let _ = err;
        false
    }
}

/// The HID++ reports a channel can carry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ReportSupport {
    pub short: bool,
    pub long: bool,
    pub very_long: bool,
    pub vlp: bool,
}

impl ReportSupport {
    pub fn supports(&self, kind: ReportKind) -> bool {
        match kind {
            ReportKind::Short => self.short,
            ReportKind::Long => self.long,
            ReportKind::VeryLong => self.very_long,
        }
    }

    /// Whether any HID++ report is supported at all.
    pub fn any(&self) -> bool {
        self.short || self.long || self.very_long || self.vlp
    }
}

/// Checks which HID++ reports a raw channel supports.
async fn report_support(chan: &dyn RawHidChannel) -> Result<ReportSupport, ChannelError> {
    if let Some(support) = chan.report_support() {
        return Ok(support);
    }

    let mut raw_descriptor = vec![0u8; MAX_REPORT_DESCRIPTOR_LENGTH];
    let descriptor_size = chan
        .get_report_descriptor(&mut raw_descriptor)
        .await
        .map_err(ChannelError::Implementation)?;

    let descriptor = match ReportDescriptor::try_from(&raw_descriptor[..descriptor_size]) {
        Ok(val) => val,
        Err(err) => return Err(ChannelError::ReportDescriptor(err)),
    };

    let has_usage = |report_id: u8, usage: u16| {
        descriptor
            .find_input_report(&[report_id])
            .and_then(|report| report.fields().first())
            .and_then(|field| match field {
                Field::Array(arr) => Some(arr.usage_range()),
                _ => None,
            })
            .is_some_and(|range| {
                range
                    .lookup_usage(&Usage::from_page_and_id(
                        UsagePage::from(HIDPP_USAGE_PAGE),
                        UsageId::from(usage),
                    ))
                    .is_some()
            })
    };

    let support = ReportSupport {
        short: has_usage(SHORT_REPORT_ID, SHORT_REPORT_USAGE),
        long: has_usage(LONG_REPORT_ID, LONG_REPORT_USAGE),
        very_long: has_usage(VERY_LONG_REPORT_ID, VERY_LONG_REPORT_USAGE),
        vlp: descriptor.find_input_report(&[VLP_NORMAL_REPORT_ID]).is_some(),
    };
    debug!(?support, "read report support from the report descriptor");

    Ok(support)
}

/// The background threads of a channel.
#[derive(Default)]
struct Workers {
    /// The sender signaling the read thread to stop.
    read_thread_close: Option<oneshot::Sender<()>>,

    /// The handle to the read thread. Should be joined after signaling
    /// [`Self::read_thread_close`].
    read_thread_hdl: Option<JoinHandle<()>>,

    /// Dropping this stops the housekeeping thread.
    housekeeping_close: Option<flume::Sender<()>>,
    housekeeping_hdl: Option<JoinHandle<()>>,
}

impl Workers {
    fn stop(&mut self) {
        if let Some(read_thread_close) = self.read_thread_close.take() {
            // This only fails if the read thread already stopped on its own.
            let _ = read_thread_close.send(());
        }
        self.housekeeping_close.take();

        for hdl in [self.read_thread_hdl.take(), self.housekeeping_hdl.take()]
            .into_iter()
            .flatten()
        {
            if hdl.thread().id() == thread::current().id() {
                continue;
            }
            if hdl.join().is_err() {
                error!("a channel thread panicked");
            }
        }
    }
}

/// Represents a HID communication channel supporting HID++.
///
/// A reader thread feeds every inbound report into the channel's
/// [`Dispatcher`]. Requests register with the dispatcher before they are
/// written, so a response can never overtake its requester.
pub struct HidppChannel {
    /// The USB vendor ID of the device.
    pub vendor_id: u16,

    /// The USB product ID of the device.
    pub product_id: u16,

    support: ReportSupport,
    config: ChannelConfig,

    /// The underlying raw HID channel.
    raw_channel: Arc<dyn RawHidChannel>,
    dispatcher: Arc<Dispatcher>,

    sw_id: AtomicU8,
    rotating_sw_id: AtomicBool,
    restarting: Arc<AtomicBool>,

    workers: Mutex<Workers>,
}

impl Drop for HidppChannel {
    fn drop(&mut self) {
        self.dispatcher.close();
        self.workers.get_mut().stop();
    }
}

impl HidppChannel {
    /// Tries to construct a HID++ channel from a raw HID channel using the
    /// default configuration.
    ///
    /// If the given HID channel does not support HID++,
    /// [`ChannelError::HidppNotSupported`] will be returned.
    pub async fn from_raw_channel(raw: impl RawHidChannel) -> Result<Self, ChannelError> {
        Self::with_config(raw, ChannelConfig::default()).await
    }

    /// Like [`Self::from_raw_channel`], with an explicit configuration.
    pub async fn with_config(
        raw: impl RawHidChannel,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        let support = report_support(&raw).await?;
        if !support.any() {
            return Err(ChannelError::HidppNotSupported);
        }

        let vendor_id = raw.vendor_id();
        let product_id = raw.product_id();
        let raw_channel: Arc<dyn RawHidChannel> = Arc::new(raw);
        let dispatcher = Arc::new(Dispatcher::new(&config));
        let restarting = Arc::new(AtomicBool::new(false));

        let (read_close_sender, read_close_receiver) = oneshot::channel::<()>();
        let read_thread_hdl = thread::Builder::new()
            .name("hidpp-reader".to_string())
            .spawn({
                let raw_channel = Arc::clone(&raw_channel);
                let dispatcher = Arc::clone(&dispatcher);
                let restarting = Arc::clone(&restarting);
                let swallow = config.restart.swallow_during_restart;

                move || {
                    futures::executor::block_on(read_loop(
                        raw_channel,
                        dispatcher,
                        restarting,
                        swallow,
                        read_close_receiver,
                    ))
                }
            })
            .map_err(|err| ChannelError::Implementation(Box::new(err)))?;

        let (housekeeping_close, housekeeping_receiver) = flume::bounded::<()>(1);
        let housekeeping_hdl = thread::Builder::new()
            .name("hidpp-housekeeping".to_string())
            .spawn({
                let dispatcher = Arc::clone(&dispatcher);

                move || {
                    while let Err(flume::RecvTimeoutError::Timeout) =
                        housekeeping_receiver.recv_timeout(HOUSEKEEPING_TICK)
                    {
                        dispatcher.expire(Instant::now());
                    }
                }
            })
            .map_err(|err| ChannelError::Implementation(Box::new(err)))?;

        debug!(
            vendor_id = %format!("{vendor_id:#06x}"),
            product_id = %format!("{product_id:#06x}"),
            ?support,
            "HID++ channel opened"
        );

        Ok(Self {
            vendor_id,
            product_id,
            support,
            sw_id: AtomicU8::new(U4::from_lo(config.default_sw_id).get().max(1)),
            config,
            raw_channel,
            dispatcher,
            rotating_sw_id: AtomicBool::new(false),
            restarting,
            workers: Mutex::new(Workers {
                read_thread_close: Some(read_close_sender),
                read_thread_hdl: Some(read_thread_hdl),
                housekeeping_close: Some(housekeeping_close),
                housekeeping_hdl: Some(housekeeping_hdl),
            }),
        })
    }

    /// The dispatcher routing everything this channel receives.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn report_support(&self) -> ReportSupport {
        self.support
    }

    /// Checks whether the channel supports the given HID++ report.
    pub fn supports(&self, kind: ReportKind) -> bool {
        self.support.supports(kind)
    }

    /// Retrieves the software ID to put into the next outgoing message.
    ///
    /// With a rotating software ID, every call returns a random ID in
    /// `1..=15`. `0` is never used as it marks unsolicited events.
    pub fn get_sw_id(&self) -> U4 {
        if self.rotating_sw_id.load(Ordering::Relaxed) {
            return U4::from_lo(rand::random_range(1..=0x0fu8));
        }

        U4::from_lo(self.sw_id.load(Ordering::Relaxed))
    }

    /// Sets the software ID used for outgoing messages. `0` is ignored.
    pub fn set_sw_id(&self, sw_id: U4) {
        if sw_id.get() == 0 {
            warn!("ignoring software ID 0, which is reserved for events");
            return;
        }
        self.sw_id.store(sw_id.get(), Ordering::Relaxed);
    }

    /// Enables or disables the rotation of the software ID, see
    /// [`Self::get_sw_id`].
    pub fn set_rotating_sw_id(&self, rotating: bool) {
        self.rotating_sw_id.store(rotating, Ordering::Relaxed);
    }

    /// Builds the smallest supported report fitting a payload.
    pub fn build_report(&self, header: ReportHeader, payload: &[u8]) -> Result<Report, ChannelError> {
        let kind = [ReportKind::Short, ReportKind::Long, ReportKind::VeryLong]
            .into_iter()
            .filter(|kind| self.supports(*kind))
            .find(|kind| kind.payload_length() >= payload.len());

        match kind {
            Some(kind) => Ok(Report::new(kind, header, payload)?),
            None => Err(ChannelError::Frame(FrameError::PayloadTooLong {
                kind: ReportKind::fitting(payload.len()).unwrap_or(ReportKind::VeryLong),
                actual: payload.len(),
            })),
        }
    }

    /// Moves a report into the smallest supported format able to carry it.
    fn fit(&self, report: Report) -> Result<Report, ChannelError> {
        if self.supports(report.kind()) {
            return Ok(report);
        }

        [ReportKind::Short, ReportKind::Long, ReportKind::VeryLong]
            .into_iter()
            .filter(|kind| kind.payload_length() > report.kind().payload_length())
            .find(|kind| self.supports(*kind))
            .map(|kind| Report::new(kind, report.header(), report.payload()))
            .transpose()?
            .ok_or(ChannelError::MessageTypeNotSupported(report.kind()))
    }

    /// Writes raw data, retrying transient failures as configured.
    async fn write(&self, data: &[u8]) -> Result<(), ChannelError> {
        trace!(data = %hex::encode(data), "writing report");

        let mut attempt = 0;
        loop {
            match self.raw_channel.write_report(data).await {
                Ok(_) => return Ok(()),
                Err(err)
                    if attempt < self.config.restart.max_retries
                        && self.raw_channel.is_transient(err.as_ref()) =>
                {
                    attempt += 1;
                    debug!(attempt, error = %err, "retrying transient write failure");
                },
                Err(err) => return Err(ChannelError::Implementation(err)),
            }
        }
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.dispatcher.is_closed() {
            return Err(ChannelError::Dispatch(DispatchError::ChannelClosed));
        }
        Ok(())
    }

    /// Sends a HID++ report across the channel and does not wait for a
    /// response.
    ///
    /// A report in a format the channel does not support is moved to the
    /// next larger supported one.
    pub async fn send(&self, report: Report) -> Result<(), ChannelError> {
        self.ensure_open()?;
        let report = self.fit(report)?;
        self.write(&report.to_bytes()).await
    }

    /// Sends a HID++ report across the channel and waits for the report
    /// echoing its header.
    ///
    /// An error report answering the request resolves to
    /// [`ChannelError::Device`]. Without any answer within
    /// [`ChannelConfig::response_timeout`], the request fails with
    /// [`DispatchError::Timeout`].
    pub async fn request(&self, report: Report) -> Result<Received, ChannelError> {
        self.ensure_open()?;
        let report = self.fit(report)?;

        let receiver = self.dispatcher.expect(
            Expectation::Report(report.header()),
            Some(self.config.response_timeout),
        );
        self.write(&report.to_bytes()).await?;

        self.await_response(receiver).await
    }

    /// Sends a payload as a VLP transfer.
    ///
    /// Every frame requests an acknowledgement, which has to arrive within
    /// [`ChannelConfig::vlp_ack_timeout`] before the next frame is sent.
    pub async fn send_vlp(&self, header: ReportHeader, payload: &[u8]) -> Result<(), ChannelError> {
        self.ensure_open()?;
        if !self.support.vlp {
            return Err(ChannelError::VlpNotSupported);
        }

        let frames = vlp::fragment(
            VLP_NORMAL_REPORT_ID,
            header,
            payload,
            self.config.vlp_fragment_payload,
            true,
        )?;

        for frame in frames {
            let ack = self
                .dispatcher
                .expect_ack(frame.header, frame.seqn, Some(self.config.vlp_ack_timeout));
            self.write(&frame.to_bytes()).await?;

            if ack.recv_async().await.is_err() {
                self.ensure_open()?;
                warn!(?header, seqn = %frame.seqn, "VLP frame was not acknowledged");
                return Err(VlpError::AckTimeout { seqn: frame.seqn }.into());
            }
        }

        Ok(())
    }

    /// Sends a payload as a VLP transfer and waits for the transfer echoing
    /// its header.
    pub async fn request_vlp(
        &self,
        header: ReportHeader,
        payload: &[u8],
    ) -> Result<Received, ChannelError> {
        let receiver = self
            .dispatcher
            .expect(Expectation::Vlp(header), Some(self.config.response_timeout));
        self.send_vlp(header, payload).await?;

        self.await_response(receiver).await
    }

    async fn await_response(
        &self,
        receiver: flume::Receiver<Received>,
    ) -> Result<Received, ChannelError> {
        match receiver.recv_async().await {
            Ok(received) => match received.device_error() {
                Some(err) => Err(ChannelError::Device(*err)),
                None => Ok(received),
            },
            Err(_) if self.dispatcher.is_closed() => {
                Err(ChannelError::Dispatch(DispatchError::ChannelClosed))
            },
            Err(_) => Err(ChannelError::Dispatch(DispatchError::Timeout)),
        }
    }

    /// Opens a restart window, e.g. right before resetting the device.
    ///
    /// While open, read errors are dropped if
    /// [`crate::config::RestartPolicy::swallow_during_restart`] is set.
    pub fn begin_restart(&self) {
        debug!("restart window opened");
        self.restarting.store(true, Ordering::Release);
    }

    pub fn end_restart(&self) {
        debug!("restart window closed");
        self.restarting.store(false, Ordering::Release);
    }

    /// Closes the channel. Pending and future requests fail with
    /// [`DispatchError::ChannelClosed`].
    pub fn close(&self) {
        self.dispatcher.close();
        self.workers.lock().stop();
    }
}

async fn read_loop(
    raw_channel: Arc<dyn RawHidChannel>,
    dispatcher: Arc<Dispatcher>,
    restarting: Arc<AtomicBool>,
    swallow_during_restart: bool,
    mut close_receiver: oneshot::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_REPORT_LENGTH];

    loop {
        let res = select! {
            _ = close_receiver => {
                break;
            },
            res = raw_channel.read_report(&mut buf).fuse() => res
        };

        let len = match res {
            Ok(len) => len,
            Err(err) => {
                if restarting.load(Ordering::Acquire) && swallow_during_restart {
                    debug!(error = %err, "dropping read error during restart");
                    continue;
                }

                dispatcher.route_transport_error(err.to_string());
                if raw_channel.is_transient(err.as_ref()) {
                    continue;
                }

                error!(error = %err, "reading from the HID channel failed");
                dispatcher.close();
                break;
            },
        };

        trace!(data = %hex::encode(&buf[..len]), "read report");
        let Ok(routed) = dispatcher.route_raw(&buf[..len], Instant::now()) else {
            continue;
        };

        if let Some(ack) = routed.ack {
            if let Err(err) = raw_channel.write_report(&ack.to_bytes()).await {
                warn!(error = %err, seqn = %ack.seqn, "could not acknowledge VLP frame");
            }
        }
    }
}

/// Represents an error that occurred when creating or interacting with a HID or
/// HID++ communication channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Indicates that the concrete implementation of [`RawHidChannel`]
    /// returned an error.
    #[error("the HID channel implementation returned an error")]
    Implementation(#[source] Box<dyn Error + Sync + Send>),

    /// Indicates that the HID report descriptor could not be parsed.
    #[error("the report descriptor could not be parsed")]
    ReportDescriptor(hidreport::ParserError),

    /// Indicates that the channel in question does not support HID++.
    #[error("the HID channel does not support HID++")]
    HidppNotSupported,

    /// Indicates that the HID++ channel does not support reports of the given
    /// type.
    #[error("the channel does not support {0:?} HID++ reports")]
    MessageTypeNotSupported(ReportKind),

    #[error("the channel does not support VLP reports")]
    VlpNotSupported,

    /// The device answered a request with an error report.
    #[error("the device reported an error: {0}")]
    Device(DeviceError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Vlp(#[from] VlpError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The device answered with something the request cannot make sense of.
    #[error("the device returned an unsupported response")]
    UnsupportedResponse,

    /// A feature required for an operation is not supported by the device.
    #[error("the device does not support feature {0:#06x}")]
    FeatureAbsent(u16),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::executor::block_on;

    use super::*;
    use crate::{
        dispatch::queue::QueueName,
        mock::MockChannel,
        protocol::error::DeviceErrorKind,
        report::Frame,
        vlp::VlpFrame,
    };

    fn config() -> ChannelConfig {
        ChannelConfig {
            response_timeout: Duration::from_millis(100),
            vlp_ack_timeout: Duration::from_millis(100),
            ..ChannelConfig::default()
        }
    }

    fn header(function_and_sw_id: u8) -> ReportHeader {
        ReportHeader {
            device_index: 0x01,
            feature_index: 0x05,
            function_and_sw_id,
        }
    }

    #[test]
    fn answers_requests_with_matching_responses() {
        let (mock, handle) = MockChannel::new(|data| {
            let mut response = vec![0x11, data[1], data[2], data[3], 0xaa];
            response.resize(20, 0);
            vec![response]
        });
        let chan = block_on(HidppChannel::with_config(mock, config())).unwrap();

        let report = chan.build_report(header(0x11), &[0x01]).unwrap();
        assert_eq!(report.kind(), ReportKind::Short);

        let response = block_on(chan.request(report)).unwrap();
        assert_eq!(response.payload()[0], 0xaa);
        assert_eq!(handle.written(), vec![vec![0x10, 0x01, 0x05, 0x11, 0x01, 0x00, 0x00]]);
    }

    #[test]
    fn moves_reports_into_supported_formats() {
        let (mock, handle) = MockChannel::with_support(
            ReportSupport {
                long: true,
                ..ReportSupport::default()
            },
            |_| Vec::new(),
        );
        let chan = block_on(HidppChannel::with_config(mock, config())).unwrap();

        let report = Report::new(ReportKind::Short, header(0x11), &[0x01, 0x02, 0x03]).unwrap();
        block_on(chan.send(report)).unwrap();

        let written = handle.written();
        assert_eq!(written[0].len(), 20);
        assert_eq!(written[0][..7], [0x11, 0x01, 0x05, 0x11, 0x01, 0x02, 0x03]);

        let report = Report::new(ReportKind::VeryLong, header(0x11), &[]).unwrap();
        assert!(matches!(
            block_on(chan.send(report)),
            Err(ChannelError::MessageTypeNotSupported(ReportKind::VeryLong))
        ));
    }

    #[test]
    fn rejects_channels_without_hidpp() {
        let (mock, _) = MockChannel::with_support(ReportSupport::default(), |_| Vec::new());

        assert!(matches!(
            block_on(HidppChannel::from_raw_channel(mock)),
            Err(ChannelError::HidppNotSupported)
        ));
    }

    #[test]
    fn surfaces_device_errors() {
        let (mock, _) = MockChannel::new(|data| {
            let mut error = vec![0x11, data[1], 0xff, data[2], data[3], 0x07];
            error.resize(20, 0);
            vec![error]
        });
        let chan = block_on(HidppChannel::with_config(mock, config())).unwrap();

        let report = chan.build_report(header(0x71), &[]).unwrap();
        let Err(ChannelError::Device(err)) = block_on(chan.request(report)) else {
            panic!("expected a device error");
        };

        assert_eq!(err.kind, DeviceErrorKind::InvalidFunctionId);
        assert_eq!(err.feature_index, 0x05);
        assert_eq!(err.function_id().get(), 0x07);
        assert!(chan.dispatcher().queue(QueueName::Error).is_empty());
    }

    #[test]
    fn times_out_without_response() {
        let (mock, _) = MockChannel::new(|_| Vec::new());
        let chan = block_on(HidppChannel::with_config(mock, config())).unwrap();

        let report = chan.build_report(header(0x11), &[]).unwrap();
        assert!(matches!(
            block_on(chan.request(report)),
            Err(ChannelError::Dispatch(DispatchError::Timeout))
        ));
    }

    #[test]
    fn closing_fails_requests() {
        let (mock, _) = MockChannel::new(|_| Vec::new());
        let chan = block_on(HidppChannel::with_config(mock, config())).unwrap();

        chan.close();

        let report = chan.build_report(header(0x11), &[]).unwrap();
        assert!(matches!(
            block_on(chan.request(report)),
            Err(ChannelError::Dispatch(DispatchError::ChannelClosed))
        ));
    }

    #[test]
    fn unsolicited_reports_reach_their_queues() {
        let (mock, handle) = MockChannel::new(|_| Vec::new());
        let chan = block_on(HidppChannel::with_config(mock, config())).unwrap();

        handle.inject(vec![0x11, 0x01, 0x09, 0x00, 0x01]);
        let mut long = vec![0x11, 0x01, 0x09, 0x00, 0x01];
        long.resize(20, 0);
        handle.inject(long);

        // The malformed report is dropped.
        let received = chan
            .dispatcher()
            .queue(QueueName::Default)
            .get(Duration::from_secs(1))
            .unwrap();
        assert_eq!(received.payload()[0], 0x01);
        assert_eq!(received.sequence, 0);
    }

    #[test]
    fn rotating_software_ids_are_never_zero() {
        let (mock, _) = MockChannel::new(|_| Vec::new());
        let chan = block_on(HidppChannel::with_config(mock, config())).unwrap();

        chan.set_sw_id(U4::from_lo(0));
        assert_eq!(chan.get_sw_id(), U4::from_lo(0x01));
        chan.set_sw_id(U4::from_lo(0x0a));
        assert_eq!(chan.get_sw_id(), U4::from_lo(0x0a));

        chan.set_rotating_sw_id(true);
        assert!((0..100).all(|_| chan.get_sw_id().get() != 0));
    }

    /// Acknowledges every VLP frame and answers complete transfers with
    /// `answer`.
    fn vlp_device(answer: Vec<u8>) -> impl Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static {
        move |data| {
            let Ok(Frame::Vlp(frame)) = Frame::parse(data, &[]) else {
                return Vec::new();
            };

            let mut replies = vec![frame.ack().to_bytes()];
            if frame.flags.end {
                let response = VlpFrame {
                    flags: vlp::VlpFlags {
                        begin: true,
                        end: true,
                        ack: false,
                    },
                    seqn: U4::from_lo(0),
                    content: answer.clone(),
                    ..frame
                };
                replies.push(response.to_bytes());
            }
            replies
        }
    }

    #[test]
    fn sends_acknowledged_vlp_fragments() {
        let (mock, handle) = MockChannel::new(vlp_device(vec![0x01]));
        let chan = block_on(HidppChannel::with_config(mock, ChannelConfig {
            vlp_fragment_payload: 30,
            ..config()
        }))
        .unwrap();

        let payload: Vec<u8> = (0..40).collect();
        let response = block_on(chan.request_vlp(header(0x21), &payload)).unwrap();
        assert_eq!(response.payload(), &[0x01]);

        let written = handle.written();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0][..5], [0x13, 0x01, 0x05, 0x21, 0xa0]);
        assert_eq!(written[0].len(), 5 + 30);
        assert_eq!(written[1][..5], [0x13, 0x01, 0x05, 0x21, 0x61]);
        assert_eq!(written[1][5..], payload[30..]);
    }

    #[test]
    fn missing_vlp_acknowledgements_abort_the_transfer() {
        let (mock, handle) = MockChannel::new(|_| Vec::new());
        let chan = block_on(HidppChannel::with_config(mock, ChannelConfig {
            vlp_fragment_payload: 30,
            ..config()
        }))
        .unwrap();

        let payload = [0u8; 40];
        assert!(matches!(
            block_on(chan.send_vlp(header(0x21), &payload)),
            Err(ChannelError::Vlp(VlpError::AckTimeout { .. }))
        ));
        assert_eq!(handle.written().len(), 1);
    }

    #[test]
    fn acknowledges_inbound_vlp_frames() {
        let (mock, handle) = MockChannel::new(|_| Vec::new());
        let chan = Arc::new(block_on(HidppChannel::with_config(mock, config())).unwrap());

        handle.inject(vec![0x13, 0x01, 0x05, 0x00, 0xe0, 0x2a]);

        let received = chan
            .dispatcher()
            .queue(QueueName::VlpEvent)
            .get(Duration::from_secs(1))
            .unwrap();
        assert_eq!(received.payload(), &[0x2a]);

        // The reader writes the acknowledgement right after routing.
        let deadline = Instant::now() + Duration::from_secs(1);
        while handle.written().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.written(), vec![vec![0x13, 0x01, 0x05, 0x00, 0x20]]);
    }
}
