//! An in-memory [`RawHidChannel`] answering writes through a closure.

use std::{error::Error, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::channel::{RawHidChannel, ReportSupport};

type Responder = Box<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

pub(crate) struct MockChannel {
    support: ReportSupport,
    responder: Responder,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    inbound_tx: flume::Sender<Vec<u8>>,
    inbound_rx: flume::Receiver<Vec<u8>>,
}

/// Inspects and drives a [`MockChannel`] after it was moved into a channel.
#[derive(Clone)]
pub(crate) struct MockHandle {
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    inbound: flume::Sender<Vec<u8>>,
}

impl MockChannel {
    /// Creates a mock supporting short, long and VLP reports. Every written
    /// report is passed to `responder`, whose answers are read back in order.
    pub(crate) fn new(
        responder: impl Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    ) -> (Self, MockHandle) {
        Self::with_support(
            ReportSupport {
                short: true,
                long: true,
                very_long: false,
                vlp: true,
            },
            responder,
        )
    }

    pub(crate) fn with_support(
        support: ReportSupport,
        responder: impl Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    ) -> (Self, MockHandle) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let (inbound_tx, inbound_rx) = flume::unbounded();

        let handle = MockHandle {
            written: Arc::clone(&written),
            inbound: inbound_tx.clone(),
        };
        let mock = Self {
            support,
            responder: Box::new(responder),
            written,
            inbound_tx,
            inbound_rx,
        };

        (mock, handle)
    }
}

impl MockHandle {
    /// Every report written so far.
    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    /// Makes the device send a report.
    pub(crate) fn inject(&self, data: Vec<u8>) {
        let _ = self.inbound.send(data);
    }
}

#[async_trait]
impl RawHidChannel for MockChannel {
    fn vendor_id(&self) -> u16 {
        0x046d
    }

    fn product_id(&self) -> u16 {
        0xc548
    }

    async fn write_report(&self, src: &[u8]) -> Result<usize, Box<dyn Error + Sync + Send>> {
        self.written.lock().push(src.to_vec());
        for reply in (self.responder)(src) {
            self.inbound_tx.send(reply)?;
        }
        Ok(src.len())
    }

    async fn read_report(&self, buf: &mut [u8]) -> Result<usize, Box<dyn Error + Sync + Send>> {
        let data = self.inbound_rx.recv_async().await?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    fn report_support(&self) -> Option<ReportSupport> {
        Some(self.support)
    }

    async fn get_report_descriptor(
        &self,
        _: &mut [u8],
    ) -> Result<usize, Box<dyn Error + Sync + Send>> {
        Err("the mock has no report descriptor".into())
    }
}
