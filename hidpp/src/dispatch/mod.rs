//! Routes inbound frames to named queues.
//!
//! The [`Dispatcher`] is fed by a single producer, the reader thread of a
//! [`crate::channel::HidppChannel`], and read by any number of consumers.
//! Every frame is classified by its report family first:
//!
//! - plain HID reports go to [`QueueName::Hid`]
//! - HID++1.0 register responses, errors and receiver notifications go to the
//!   receiver queues
//! - HID++2.0 reports are mapped to their feature through the device's
//!   [`FeatureMap`] and land in the queue of the feature's category, or in an
//!   event queue if unsolicited
//! - VLP frames are reassembled first and then routed like HID++2.0 reports,
//!   using the device's VLP feature map
//!
//! A message matching a pending request is handed to the waiting requester
//! instead of being queued.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use self::queue::{Queue, QueueName};
use crate::{
    config::ChannelConfig,
    container::Container,
    event::EventEmitter,
    feature::{
        map::{FeatureFamily, FeatureMap},
        registry::{self, MessageClass, MessageKind},
    },
    formats::keyboard,
    nibble::U4,
    protocol::{
        error::{DeviceError, ErrorFamily},
        v10::{self, DeviceConnection, MessageType},
        v20,
    },
    report::{Frame, FrameError, Report, ReportHeader},
    vlp::{Progress, Reassembler, VlpError, VlpFrame, VlpMessage},
};

pub mod queue;

/// What a routed message carries.
#[derive(Clone, Debug)]
pub enum Content {
    /// A HID++1.0 or HID++2.0 report.
    Report(Report),

    /// A reassembled VLP transfer.
    Vlp(VlpMessage),

    /// A VLP acknowledgement nobody waited for.
    VlpAck(VlpFrame),

    /// A plain HID input report.
    Hid { report_id: u8, data: Vec<u8> },

    /// An error reported by a device or receiver.
    DeviceError(DeviceError),

    /// A VLP transfer that failed to reassemble.
    Transfer { header: ReportHeader, error: VlpError },

    /// A transport read failure.
    Transport(String),
}

/// A message delivered by the dispatcher.
#[derive(Clone, Debug)]
pub struct Received {
    /// Increases by one with every routed message of a dispatcher.
    pub sequence: u64,
    pub timestamp: Instant,
    pub content: Content,

    /// The schema the message was matched to, if any.
    pub class: Option<&'static MessageClass>,

    /// The payload decoded through [`Self::class`].
    pub fields: Option<Container>,
}

impl Received {
    /// The payload following the header, empty for contents without one.
    pub fn payload(&self) -> &[u8] {
        match &self.content {
            Content::Report(report) => report.payload(),
            Content::Vlp(msg) => &msg.payload,
            Content::Hid { data, .. } => data,
            _ => &[],
        }
    }

    pub fn header(&self) -> Option<ReportHeader> {
        match &self.content {
            Content::Report(report) => Some(report.header()),
            Content::Vlp(msg) => Some(msg.header),
            Content::VlpAck(frame) => Some(frame.header),
            Content::Transfer { header, .. } => Some(*header),
            Content::DeviceError(err) => Some(err.request_header()),
            Content::Hid { .. } | Content::Transport(_) => None,
        }
    }

    pub fn report(&self) -> Option<&Report> {
        match &self.content {
            Content::Report(report) => Some(report),
            _ => None,
        }
    }

    pub fn device_error(&self) -> Option<&DeviceError> {
        match &self.content {
            Content::DeviceError(err) => Some(err),
            _ => None,
        }
    }
}

/// What a pending requester waits for.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Expectation {
    /// A report echoing the request header, or an error for it.
    Report(ReportHeader),

    /// A VLP transfer echoing the request header, or an error for it.
    Vlp(ReportHeader),
}

impl Expectation {
    fn matches(&self, received: &Received) -> bool {
        match (self, &received.content) {
            (Self::Report(header), Content::Report(report)) => report.header() == *header,
            (Self::Vlp(header), Content::Vlp(msg)) => msg.header == *header,
            (Self::Report(header) | Self::Vlp(header), Content::DeviceError(err)) => {
                err.request_header() == *header
            },
            _ => false,
        }
    }
}

struct Pending {
    expectation: Expectation,
    deadline: Option<Instant>,
    sender: flume::Sender<Received>,
}

struct AckWaiter {
    header: ReportHeader,
    seqn: U4,
    deadline: Option<Instant>,
    sender: flume::Sender<VlpFrame>,
}

/// Where a routed frame ended up.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Delivery {
    Queue(QueueName),

    /// Handed to a pending requester.
    Waiter,

    /// Held by the VLP reassembler until the transfer completes.
    Buffered,

    /// The target queue was closed.
    Dropped,
}

/// The outcome of routing a single frame.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Routed {
    pub delivery: Delivery,

    /// The acknowledgement to send back for a VLP frame that requested one.
    pub ack: Option<VlpFrame>,
}

impl Routed {
    fn delivered(delivery: Delivery) -> Self {
        Self {
            delivery,
            ack: None,
        }
    }
}

/// A multi-queue fan-out of inbound HID++ traffic.
pub struct Dispatcher {
    /// Indexed by the declaration order of [`QueueName`].
    queues: Vec<Queue<Received>>,
    maps: RwLock<HashMap<(u8, FeatureFamily), Arc<FeatureMap>>>,
    reassembler: Mutex<Reassembler>,
    pending: Mutex<Vec<Pending>>,
    acks: Mutex<Vec<AckWaiter>>,

    /// Extra queues receiving a copy of every message for a queue.
    broadcasts: RwLock<Vec<(QueueName, QueueName)>>,
    subscribers: EventEmitter<Received>,
    sequence: AtomicU64,
    hid_report_ids: Vec<u8>,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            queues: QueueName::ALL.into_iter().map(Queue::new).collect(),
            maps: RwLock::new(HashMap::new()),
            reassembler: Mutex::new(Reassembler::new(config.vlp_reassembly_timeout)),
            pending: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            broadcasts: RwLock::new(Vec::new()),
            subscribers: EventEmitter::new(),
            sequence: AtomicU64::new(0),
            hid_report_ids: config.hid_report_ids.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn queue(&self, name: QueueName) -> &Queue<Received> {
        &self.queues[name as usize]
    }

    /// The HID++2.0 feature map of a device, created on first use.
    pub fn feature_map(&self, device_index: u8) -> Arc<FeatureMap> {
        self.map(device_index, FeatureFamily::Hidpp20)
    }

    /// The VLP feature map of a device, created on first use.
    pub fn vlp_feature_map(&self, device_index: u8) -> Arc<FeatureMap> {
        self.map(device_index, FeatureFamily::Vlp)
    }

    fn map(&self, device_index: u8, family: FeatureFamily) -> Arc<FeatureMap> {
        if let Some(map) = self.maps.read().get(&(device_index, family)) {
            return Arc::clone(map);
        }

        let mut maps = self.maps.write();
        Arc::clone(
            maps.entry((device_index, family))
                .or_insert_with(|| Arc::new(FeatureMap::new(device_index, family))),
        )
    }

    /// Makes every message delivered to `from` also appear in `also`.
    pub fn add_broadcast(&self, from: QueueName, also: QueueName) {
        let mut broadcasts = self.broadcasts.write();
        if !broadcasts.contains(&(from, also)) {
            broadcasts.push((from, also));
        }
    }

    /// Creates a receiver getting a copy of every routed message.
    pub fn subscribe(&self) -> flume::Receiver<Received> {
        self.subscribers.create_receiver()
    }

    /// Registers a requester. The matching message is sent through the
    /// returned receiver instead of being queued.
    ///
    /// The receiver disconnects once the deadline passes (see
    /// [`Self::expire`]) or the dispatcher closes.
    pub fn expect(
        &self,
        expectation: Expectation,
        timeout: Option<Duration>,
    ) -> flume::Receiver<Received> {
        let (sender, receiver) = flume::bounded(1);
        if self.is_closed() {
            return receiver;
        }

        self.pending.lock().push(Pending {
            expectation,
            deadline: timeout.and_then(|timeout| Instant::now().checked_add(timeout)),
            sender,
        });
        receiver
    }

    /// Registers a VLP sender waiting for the acknowledgement of a frame.
    pub fn expect_ack(
        &self,
        header: ReportHeader,
        seqn: U4,
        timeout: Option<Duration>,
    ) -> flume::Receiver<VlpFrame> {
        let (sender, receiver) = flume::bounded(1);
        if self.is_closed() {
            return receiver;
        }

        self.acks.lock().push(AckWaiter {
            header,
            seqn,
            deadline: timeout.and_then(|timeout| Instant::now().checked_add(timeout)),
            sender,
        });
        receiver
    }

    /// Drops waiters whose deadline has passed and discards stale VLP
    /// transfers.
    pub fn expire(&self, now: Instant) {
        let alive = |deadline: Option<Instant>| deadline.is_none_or(|deadline| deadline > now);

        self.pending
            .lock()
            .retain(|pending| alive(pending.deadline) && !pending.sender.is_disconnected());
        self.acks
            .lock()
            .retain(|waiter| alive(waiter.deadline) && !waiter.sender.is_disconnected());
        self.reassembler.lock().expire(now);
    }

    /// Parses and routes raw inbound data.
    ///
    /// Frames that cannot be parsed are dropped and their error returned.
    pub fn route_raw(&self, data: &[u8], now: Instant) -> Result<Routed, FrameError> {
        match Frame::parse(data, &self.hid_report_ids) {
            Ok(frame) => Ok(self.route_frame(frame, now)),
            Err(err) => {
                warn!(error = %err, data = %hex::encode(data), "dropping inbound frame");
                Err(err)
            },
        }
    }

    pub fn route_frame(&self, frame: Frame, now: Instant) -> Routed {
        match frame {
            Frame::Hidpp(report) => Routed::delivered(self.route_report(report)),
            Frame::Vlp(frame) => self.route_vlp(frame, now),
            Frame::Hid { report_id, data } => {
                let fields = (data.len() == keyboard::BITMAP_SIZE)
                    .then(|| keyboard::decode(&data))
                    .and_then(|decoded| {
                        decoded
                            .inspect_err(|err| debug!("undecodable key bitmap: {err}"))
                            .ok()
                    });
                Routed::delivered(self.deliver(
                    Content::Hid { report_id, data },
                    None,
                    fields,
                    QueueName::Hid,
                    None,
                ))
            },
        }
    }

    /// Delivers a transport failure to the error queue.
    pub fn route_transport_error(&self, message: String) -> Delivery {
        self.deliver(Content::Transport(message), None, None, QueueName::Error, None)
    }

    fn route_report(&self, report: Report) -> Delivery {
        let header = report.header();

        if let Some(err) = DeviceError::from_report(&report) {
            let queue = match err.family {
                ErrorFamily::Hidpp20 => QueueName::Error,
                ErrorFamily::Hidpp10 => QueueName::ReceiverError,
            };
            return self.deliver(Content::DeviceError(err), None, None, queue, None);
        }

        let map = self.feature_map(header.device_index);
        let Some(entry) = map.by_index(header.feature_index) else {
            return self.route_hidpp10(report);
        };

        let msg = v20::Message::from(report);
        let function = msg.header().function_id.get();
        let software_id = msg.header().software_id.get();

        let class = registry::lookup(entry.feature_id, entry.version)
            .ok()
            .and_then(|bundle| bundle.classify(function, software_id));
        let fields = class.and_then(|class| decode(class, report.payload()));

        let queue = match class {
            Some(MessageClass {
                queue: Some(queue), ..
            }) => *queue,
            _ if software_id == 0 => QueueName::Event,
            _ => registry::category_of(entry.feature_id).queue(false),
        };

        self.deliver(Content::Report(report), class, fields, queue, None)
    }

    fn route_hidpp10(&self, report: Report) -> Delivery {
        let sub_id = report.header().feature_index;

        if MessageType::is_battery_notification(sub_id) {
            return self.deliver(
                Content::Report(report),
                None,
                None,
                QueueName::BatteryEvent,
                None,
            );
        }

        if MessageType::is_register(sub_id) {
            return self.deliver(
                Content::Report(report),
                None,
                None,
                QueueName::ReceiverResponse,
                None,
            );
        }

        if MessageType::is_notification(sub_id) {
            let connection_change = sub_id == u8::from(MessageType::DeviceConnection)
                || sub_id == u8::from(MessageType::DeviceDisconnection);
            if !connection_change {
                return self.deliver(
                    Content::Report(report),
                    None,
                    None,
                    QueueName::ReceiverEvent,
                    None,
                );
            }

            // A failed link is an error for whoever waits on the device.
            let link_failed = v10::Message::try_from(report)
                .ok()
                .and_then(|msg| DeviceConnection::from_message(&msg))
                .is_some_and(|conn| !conn.link_established);
            return self.deliver(
                Content::Report(report),
                None,
                None,
                QueueName::ReceiverConnectionEvent,
                link_failed.then_some(QueueName::Error),
            );
        }

        self.deliver(Content::Report(report), None, None, QueueName::Default, None)
    }

    fn route_vlp(&self, frame: VlpFrame, now: Instant) -> Routed {
        if frame.is_ack() {
            return Routed::delivered(self.route_ack(frame));
        }

        let ack = frame.flags.ack.then(|| frame.ack());
        let progress = self.reassembler.lock().accept(&frame, now);

        match progress {
            Ok(Progress::Pending) => Routed {
                delivery: Delivery::Buffered,
                ack,
            },
            Ok(Progress::Complete(msg)) => Routed {
                delivery: self.route_vlp_message(msg),
                ack,
            },
            Err(error) => {
                warn!(error = %error, header = ?frame.header, "discarding VLP transfer");
                Routed::delivered(self.deliver(
                    Content::Transfer {
                        header: frame.header,
                        error,
                    },
                    None,
                    None,
                    QueueName::Error,
                    None,
                ))
            },
        }
    }

    fn route_ack(&self, frame: VlpFrame) -> Delivery {
        let mut acks = self.acks.lock();
        acks.retain(|waiter| !waiter.sender.is_disconnected());

        let position = acks
            .iter()
            .position(|waiter| waiter.header == frame.header && waiter.seqn == frame.seqn);
        if let Some(position) = position {
            let waiter = acks.remove(position);
            if waiter.sender.send(frame.clone()).is_ok() {
                trace!(header = ?frame.header, seqn = %frame.seqn, "VLP frame acknowledged");
                return Delivery::Waiter;
            }
        }
        drop(acks);

        debug!(header = ?frame.header, seqn = %frame.seqn, "unexpected VLP acknowledgement");
        self.deliver(Content::VlpAck(frame), None, None, QueueName::VlpCommon, None)
    }

    fn route_vlp_message(&self, msg: VlpMessage) -> Delivery {
        let header = msg.header;

        if header.feature_index == v20::ERROR_FEATURE_INDEX {
            if let Some(err) = DeviceError::read(ErrorFamily::Hidpp20, header, &msg.payload) {
                return self.deliver(Content::DeviceError(err), None, None, QueueName::Error, None);
            }
        }

        let Some(entry) = self
            .vlp_feature_map(header.device_index)
            .by_index(header.feature_index)
        else {
            let queue = match msg.software_id().get() {
                0 => QueueName::VlpEvent,
                _ => QueueName::Default,
            };
            return self.deliver(Content::Vlp(msg), None, None, queue, None);
        };

        let function = msg.function_id().get();
        let software_id = msg.software_id().get();

        let class = registry::lookup(entry.feature_id, entry.version)
            .ok()
            .and_then(|bundle| bundle.classify(function, software_id));
        let fields = class.and_then(|class| decode(class, &msg.payload));

        let queue = match class {
            Some(MessageClass {
                queue: Some(queue), ..
            }) => *queue,
            Some(MessageClass {
                kind: MessageKind::Event,
                ..
            }) => QueueName::VlpEvent,
            _ if software_id == 0 => QueueName::VlpEvent,
            _ => registry::category_of(entry.feature_id).queue(true),
        };

        self.deliver(Content::Vlp(msg), class, fields, queue, None)
    }

    fn deliver(
        &self,
        content: Content,
        class: Option<&'static MessageClass>,
        fields: Option<Container>,
        queue: QueueName,
        also: Option<QueueName>,
    ) -> Delivery {
        let received = Received {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: Instant::now(),
            content,
            class,
            fields,
        };
        trace!(
            sequence = received.sequence,
            queue = %queue,
            class = class.map(|class| class.name),
            "routed message"
        );

        self.subscribers.emit(&received);

        let received = match self.complete_pending(received) {
            Ok(()) => return Delivery::Waiter,
            Err(received) => received,
        };

        let broadcasts = self.broadcasts.read();
        let targets = also.into_iter().chain(
            broadcasts
                .iter()
                .filter(|(from, _)| *from == queue)
                .map(|(_, also)| *also),
        );
        for target in targets {
            self.queue(target).push(received.clone());
        }

        if self.queue(queue).push(received) {
            Delivery::Queue(queue)
        } else {
            Delivery::Dropped
        }
    }

    /// Hands a message to the first requester expecting it.
    fn complete_pending(&self, mut received: Received) -> Result<(), Received> {
        let mut pending = self.pending.lock();
        pending.retain(|pending| !pending.sender.is_disconnected());

        while let Some(position) = pending
            .iter()
            .position(|pending| pending.expectation.matches(&received))
        {
            let waiter = pending.remove(position);
            match waiter.sender.send(received) {
                Ok(()) => return Ok(()),
                Err(flume::SendError(back)) => received = back,
            }
        }

        Err(received)
    }

    /// Empties every queue. Returns the amount of dropped messages.
    pub fn clear_all_queues(&self) -> usize {
        self.queues.iter().map(|queue| queue.clear().len()).sum()
    }

    /// Closes every queue, disconnects every waiter and subscriber and
    /// releases the feature maps and reassembly slots.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for queue in &self.queues {
            queue.close();
        }
        self.pending.lock().clear();
        self.acks.lock().clear();
        self.subscribers.close();
        self.reassembler.lock().clear();
        self.maps.write().clear();
        debug!("dispatcher closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn decode(class: &MessageClass, payload: &[u8]) -> Option<Container> {
    match class.decode(payload) {
        Ok(fields) => Some(fields),
        Err(err) => {
            warn!(class = class.name, error = %err, "could not decode payload");
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{queue::DispatchError, *};
    use crate::{
        feature::{FeatureType, map::FeatureEntry},
        protocol::error::DeviceErrorKind,
        report::{LONG_REPORT_LENGTH, VLP_NORMAL_REPORT_ID},
        vlp::VlpFlags,
    };

    const WAIT: Duration = Duration::from_millis(50);

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(&ChannelConfig::default().with_hid_report_ids(&[0x01]))
    }

    fn map_battery(dispatcher: &Dispatcher, index: u8) {
        dispatcher.feature_map(0x01).insert(FeatureEntry {
            feature_id: 0x1004,
            index,
            version: 0,
            typ: FeatureType::default(),
        });
    }

    fn long(bytes: &[u8]) -> Vec<u8> {
        let mut out = bytes.to_vec();
        out.resize(LONG_REPORT_LENGTH, 0);
        out
    }

    #[test]
    fn routes_responses_by_feature_category() {
        let dispatcher = dispatcher();
        map_battery(&dispatcher, 0x06);

        let routed = dispatcher
            .route_raw(&long(&[0x11, 0x01, 0x06, 0x11, 0x32, 0x08, 0x00, 0x00]), Instant::now())
            .unwrap();
        assert_eq!(routed.delivery, Delivery::Queue(QueueName::Common));

        let received = dispatcher.queue(QueueName::Common).get(WAIT).unwrap();
        assert_eq!(received.class.unwrap().name, "GetStatus");
        let fields = received.fields.unwrap();
        assert_eq!(fields.get_uint("state_of_charge").unwrap(), 0x32);
        assert_eq!(fields.get_uint("battery_level_full").unwrap(), 1);
    }

    #[test]
    fn unregistered_feature_versions_stay_unclassified() {
        let dispatcher = dispatcher();
        dispatcher.feature_map(0x01).insert(FeatureEntry {
            feature_id: 0x1004,
            index: 0x06,
            version: 5,
            typ: FeatureType::default(),
        });

        let routed = dispatcher
            .route_raw(&long(&[0x11, 0x01, 0x06, 0x11, 0x32, 0x08, 0x00, 0x00]), Instant::now())
            .unwrap();
        assert_eq!(routed.delivery, Delivery::Queue(QueueName::Common));

        let received = dispatcher.queue(QueueName::Common).get(WAIT).unwrap();
        assert!(received.class.is_none());
        assert!(received.fields.is_none());
    }

    #[test]
    fn routes_unsolicited_battery_events() {
        let dispatcher = dispatcher();
        map_battery(&dispatcher, 0x06);

        dispatcher
            .route_raw(&long(&[0x11, 0x01, 0x06, 0x00, 0x14, 0x02, 0x00]), Instant::now())
            .unwrap();

        let received = dispatcher.queue(QueueName::BatteryEvent).get(WAIT).unwrap();
        let class = received.class.unwrap();
        assert_eq!(class.kind, MessageKind::Event);
        assert_eq!(received.fields.unwrap().get_uint("state_of_charge").unwrap(), 0x14);
    }

    #[test]
    fn routes_root_responses_to_the_important_queue() {
        let dispatcher = dispatcher();

        dispatcher
            .route_raw(&long(&[0x11, 0x01, 0x00, 0x01, 0x05, 0x00, 0x02]), Instant::now())
            .unwrap();

        let received = dispatcher.queue(QueueName::Important).get(WAIT).unwrap();
        let fields = received.fields.unwrap();
        assert_eq!(fields.get_uint("feature_index").unwrap(), 0x05);
        assert_eq!(fields.get_uint("feature_version").unwrap(), 0x02);
    }

    #[test]
    fn unmapped_feature_indices_go_to_the_default_queue() {
        let dispatcher = dispatcher();

        dispatcher
            .route_raw(&long(&[0x11, 0x01, 0x09, 0x01, 0xaa]), Instant::now())
            .unwrap();

        assert!(dispatcher.queue(QueueName::Default).get(WAIT).is_ok());
    }

    #[test]
    fn correlates_errors_with_pending_requests() {
        let dispatcher = dispatcher();
        map_battery(&dispatcher, 0x06);

        let request = ReportHeader {
            device_index: 0x01,
            feature_index: 0x06,
            function_and_sw_id: 0x71,
        };
        let waiter = dispatcher.expect(Expectation::Report(request), Some(WAIT));

        let routed = dispatcher
            .route_raw(&long(&[0x11, 0x01, 0xff, 0x06, 0x71, 0x07]), Instant::now())
            .unwrap();
        assert_eq!(routed.delivery, Delivery::Waiter);

        let received = waiter.recv_timeout(WAIT).unwrap();
        let err = received.device_error().unwrap();
        assert_eq!(err.kind, DeviceErrorKind::InvalidFunctionId);
        assert_eq!(err.device_index, 0x01);
        assert_eq!(err.feature_index, 0x06);
        assert_eq!(err.software_id().get(), 0x01);
        assert!(dispatcher.queue(QueueName::Error).is_empty());
    }

    #[test]
    fn uncorrelated_errors_are_queued() {
        let dispatcher = dispatcher();

        dispatcher
            .route_raw(&long(&[0x11, 0x01, 0xff, 0x06, 0x71, 0x05]), Instant::now())
            .unwrap();

        let received = dispatcher.queue(QueueName::Error).get(WAIT).unwrap();
        assert_eq!(received.device_error().unwrap().kind, DeviceErrorKind::NotAllowed);
    }

    #[test]
    fn routes_hidpp10_traffic() {
        let dispatcher = dispatcher();
        let now = Instant::now();

        dispatcher
            .route_raw(&[0x10, 0xff, 0x81, 0x02, 0x00, 0x03, 0x00], now)
            .unwrap();
        dispatcher
            .route_raw(&[0x10, 0xff, 0x8f, 0x81, 0x02, 0x02, 0x00], now)
            .unwrap();
        dispatcher
            .route_raw(&[0x10, 0x02, 0x41, 0x10, 0x02, 0x8a, 0x40], now)
            .unwrap();
        dispatcher
            .route_raw(&[0x10, 0x02, 0x4b, 0x01, 0x00, 0x00, 0x00], now)
            .unwrap();

        assert!(dispatcher.queue(QueueName::ReceiverResponse).get(WAIT).is_ok());
        let err = dispatcher.queue(QueueName::ReceiverError).get(WAIT).unwrap();
        assert_eq!(err.device_error().unwrap().kind, DeviceErrorKind::InvalidAddress);
        assert!(dispatcher.queue(QueueName::ReceiverConnectionEvent).get(WAIT).is_ok());
        assert!(dispatcher.queue(QueueName::ReceiverEvent).get(WAIT).is_ok());

        // The link was established, so nothing was copied to the error queue.
        assert!(dispatcher.queue(QueueName::Error).is_empty());
    }

    #[test]
    fn routes_hidpp10_battery_notifications() {
        let dispatcher = dispatcher();
        let now = Instant::now();

        dispatcher
            .route_raw(&[0x10, 0x01, 0x07, 0x07, 0x00, 0x00, 0x00], now)
            .unwrap();
        dispatcher
            .route_raw(&[0x10, 0x01, 0x0d, 0x5a, 0x00, 0x00, 0x00], now)
            .unwrap();

        let status = dispatcher.queue(QueueName::BatteryEvent).get(WAIT).unwrap();
        assert_eq!(status.report().unwrap().header().feature_index, 0x07);
        let mileage = dispatcher.queue(QueueName::BatteryEvent).get(WAIT).unwrap();
        assert_eq!(mileage.payload()[0], 0x00);
        assert_eq!(mileage.report().unwrap().header().function_and_sw_id, 0x5a);
        assert!(dispatcher.queue(QueueName::ReceiverEvent).is_empty());
        assert!(dispatcher.queue(QueueName::Default).is_empty());
    }

    #[test]
    fn failed_links_are_broadcast_to_the_error_queue() {
        let dispatcher = dispatcher();

        dispatcher
            .route_raw(&[0x10, 0x02, 0x41, 0x10, 0x42, 0x8a, 0x40], Instant::now())
            .unwrap();

        let connection = dispatcher.queue(QueueName::ReceiverConnectionEvent).get(WAIT).unwrap();
        let error = dispatcher.queue(QueueName::Error).get(WAIT).unwrap();
        assert_eq!(connection.sequence, error.sequence);
    }

    #[test]
    fn rejects_unknown_reports() {
        let dispatcher = dispatcher();

        assert_eq!(
            dispatcher.route_raw(&[0x05, 0x01], Instant::now()),
            Err(FrameError::UnknownReport(0x05))
        );
        assert!(dispatcher.queues.iter().all(Queue::is_empty));

        let routed = dispatcher.route_raw(&[0x01, 0x00, 0x04], Instant::now()).unwrap();
        assert_eq!(routed.delivery, Delivery::Queue(QueueName::Hid));
    }

    #[test]
    fn decodes_keyboard_bitmaps_on_the_hid_queue() {
        let dispatcher = dispatcher();

        let mut report = vec![0x01];
        report.extend_from_slice(&[0u8; keyboard::BITMAP_SIZE]);
        report[1] = 0x01;
        report[2] = 0x01;
        dispatcher.route_raw(&report, Instant::now()).unwrap();

        let received = dispatcher.queue(QueueName::Hid).get(WAIT).unwrap();
        let keys = received.fields.as_ref().unwrap();
        assert_eq!(
            keyboard::pressed(keys).unwrap(),
            vec!["keyboard_left_control", "keyboard_a"]
        );
        assert_eq!(received.payload().len(), keyboard::BITMAP_SIZE);

        dispatcher.route_raw(&[0x01, 0x00, 0x04], Instant::now()).unwrap();
        let short = dispatcher.queue(QueueName::Hid).get(WAIT).unwrap();
        assert!(short.fields.is_none());
    }

    #[test]
    fn preserves_arrival_order_within_a_queue() {
        let dispatcher = dispatcher();
        map_battery(&dispatcher, 0x06);

        for charge in 0..50u8 {
            dispatcher
                .route_raw(&long(&[0x11, 0x01, 0x06, 0x00, charge]), Instant::now())
                .unwrap();
        }

        let queue = dispatcher.queue(QueueName::BatteryEvent);
        let mut last_sequence = None;
        for charge in 0..50u8 {
            let received = queue.get(WAIT).unwrap();
            assert_eq!(received.payload()[0], charge);
            assert!(last_sequence < Some(received.sequence));
            last_sequence = Some(received.sequence);
        }
    }

    #[test]
    fn subscribers_and_broadcasts_get_copies() {
        let dispatcher = dispatcher();
        let subscriber = dispatcher.subscribe();
        dispatcher.add_broadcast(QueueName::Hid, QueueName::Default);

        dispatcher.route_raw(&[0x01, 0x02], Instant::now()).unwrap();

        assert_eq!(subscriber.try_recv().unwrap().payload(), &[0x02]);
        assert!(dispatcher.queue(QueueName::Hid).get(WAIT).is_ok());
        assert!(dispatcher.queue(QueueName::Default).get(WAIT).is_ok());
    }

    fn vlp_frame(flags: VlpFlags, seqn: u8, content: Vec<u8>) -> VlpFrame {
        VlpFrame {
            report_id: VLP_NORMAL_REPORT_ID,
            header: ReportHeader {
                device_index: 0x01,
                feature_index: 0x03,
                function_and_sw_id: 0x00,
            },
            flags,
            seqn: U4::from_lo(seqn),
            content,
        }
    }

    #[test]
    fn reassembles_two_acknowledged_vlp_fragments() {
        let dispatcher = dispatcher();
        dispatcher.vlp_feature_map(0x01).insert(FeatureEntry {
            feature_id: 0x19a1,
            index: 0x03,
            version: 0,
            typ: FeatureType::default(),
        });
        let payload: Vec<u8> = (0..40).collect();
        let now = Instant::now();

        let first = vlp_frame(
            VlpFlags {
                begin: true,
                end: false,
                ack: true,
            },
            0,
            payload[..30].to_vec(),
        );
        let routed = dispatcher.route_frame(Frame::Vlp(first.clone()), now);
        assert_eq!(routed.delivery, Delivery::Buffered);
        assert_eq!(routed.ack, Some(first.ack()));

        let second = vlp_frame(
            VlpFlags {
                begin: false,
                end: true,
                ack: true,
            },
            1,
            payload[30..].to_vec(),
        );
        let routed = dispatcher.route_frame(Frame::Vlp(second.clone()), now);
        assert_eq!(routed.delivery, Delivery::Queue(QueueName::VlpEvent));
        assert_eq!(routed.ack.unwrap().seqn, U4::from_lo(1));

        let received = dispatcher.queue(QueueName::VlpEvent).get(WAIT).unwrap();
        assert_eq!(received.payload(), payload.as_slice());
    }

    #[test]
    fn out_of_order_vlp_fragments_reach_the_error_queue() {
        let dispatcher = dispatcher();
        let now = Instant::now();

        let first = vlp_frame(
            VlpFlags {
                begin: true,
                ..VlpFlags::default()
            },
            0,
            vec![0xaa; 10],
        );
        let skipped = vlp_frame(VlpFlags::default(), 2, vec![0xbb; 10]);

        dispatcher.route_frame(Frame::Vlp(first), now);
        let routed = dispatcher.route_frame(Frame::Vlp(skipped), now);
        assert_eq!(routed.ack, None);

        let received = dispatcher.queue(QueueName::Error).get(WAIT).unwrap();
        assert!(matches!(
            received.content,
            Content::Transfer {
                error: VlpError::SequenceError { .. },
                ..
            }
        ));
    }

    #[test]
    fn acknowledgements_resolve_waiting_senders() {
        let dispatcher = dispatcher();
        let frame = vlp_frame(
            VlpFlags {
                begin: true,
                end: false,
                ack: true,
            },
            0,
            vec![0x01],
        );
        let waiter = dispatcher.expect_ack(frame.header, frame.seqn, Some(WAIT));

        let routed = dispatcher.route_frame(Frame::Vlp(frame.ack()), Instant::now());
        assert_eq!(routed.delivery, Delivery::Waiter);
        assert!(waiter.recv_timeout(WAIT).unwrap().is_ack());

        let routed = dispatcher.route_frame(Frame::Vlp(frame.ack()), Instant::now());
        assert_eq!(routed.delivery, Delivery::Queue(QueueName::VlpCommon));
    }

    #[test]
    fn expired_waiters_are_disconnected() {
        let dispatcher = dispatcher();
        let header = ReportHeader {
            device_index: 0x01,
            feature_index: 0x00,
            function_and_sw_id: 0x01,
        };
        let waiter = dispatcher.expect(Expectation::Report(header), Some(Duration::ZERO));

        dispatcher.expire(Instant::now() + Duration::from_millis(1));

        assert!(waiter.recv_timeout(WAIT).is_err());
    }

    #[test]
    fn closing_unblocks_everything() {
        let dispatcher = dispatcher();
        let header = ReportHeader {
            device_index: 0x01,
            feature_index: 0x00,
            function_and_sw_id: 0x01,
        };
        let waiter = dispatcher.expect(Expectation::Report(header), None);
        let subscriber = dispatcher.subscribe();

        dispatcher.close();

        assert!(waiter.recv().is_err());
        assert!(subscriber.recv().is_err());
        assert_eq!(
            dispatcher.queue(QueueName::Common).get(WAIT).unwrap_err(),
            DispatchError::ChannelClosed
        );
        assert_eq!(
            dispatcher.route_transport_error("gone".to_string()),
            Delivery::Dropped
        );
    }

    #[test]
    fn clearing_drops_queued_messages() {
        let dispatcher = dispatcher();
        dispatcher.route_raw(&[0x01, 0x02], Instant::now()).unwrap();
        dispatcher.route_transport_error("broken pipe".to_string());

        assert_eq!(dispatcher.clear_all_queues(), 2);
        assert!(dispatcher.queue(QueueName::Error).is_empty());
    }
}
