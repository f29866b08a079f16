//! A codec for Logitech's HID++ protocol.
//!
//! HID++ extends standard [HID](https://en.wikipedia.org/wiki/Human_interface_device)
//! with short (7 byte), long (20 byte) and very long (64 byte) reports, plus
//! VLP transfers that fragment larger payloads over several frames. This crate
//! turns raw reports into typed messages and back, routes inbound traffic to
//! named queues and correlates responses with the requests that caused them.
//!
//! Logitech kindly provided a [public Google Drive folder](https://drive.google.com/drive/folders/0BxbRzx7vEV7eWmgwazJ3NUFfQ28)
//! with a lot of documentation on HID++ and several device features. The
//! [Solaar](https://github.com/pwr-Solaar/Solaar) project was of great help in
//! understanding how things work in practice.
//!
//! # Declaring message layouts
//!
//! Every payload is described by a [`container::FieldTable`]: an ordered list
//! of bit fields with names, aliases, defaults, validators and an optional
//! little-endian byte order. Tables are frozen once built. Variants of a
//! layout are derived from a parent by copying and editing it, which leaves
//! the parent untouched.
//!
//! ```
//! use hidpp::{codec, formats::image::IMAGE_HEADER};
//!
//! let bytes = hex::decode("3DB8F39600000000000200000010000001000000010000000000000000000000").unwrap();
//! let header = codec::decode_bytes(&IMAGE_HEADER, &bytes).unwrap();
//!
//! assert_eq!(header.get_uint("hdr_size").unwrap(), 512);
//! assert_eq!(header.get_container("image_version").unwrap().get_uint("major").unwrap(), 1);
//! ```
//!
//! # Talking to a device
//!
//! This crate implements HID++, not the underlying HID communication, which
//! is left to an external crate of your choice. The trait bridging your HID
//! implementation to this crate is [`channel::RawHidChannel`]. It defines
//! async methods using [`mod@async_trait`], which is re-exported for
//! annotating your implementing type.
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use hidpp::{channel::HidppChannel, feature::{self, unified_battery::UnifiedBatteryFeature}};
//!
//! // Fails with `ChannelError::HidppNotSupported` if the HID interface does
//! // not carry HID++ reports.
//! let channel = Arc::new(HidppChannel::from_raw_channel(my_hid_channel).await?);
//!
//! // The software ID is 0x01 by default. Rotating it eases telling apart
//! // responses to concurrent requests.
//! channel.set_rotating_sw_id(true);
//!
//! // Features are addressed by their index in the device's feature table,
//! // which is looked up through the root feature and cached per device.
//! if let Some(battery) = feature::resolve::<UnifiedBatteryFeature>(&channel, 0x01).await? {
//!     println!("{:?}", battery.get_battery_info().await?);
//! }
//!
//! // Unsolicited traffic ends up in the dispatcher's queues.
//! let events = channel.dispatcher().queue(hidpp::dispatch::queue::QueueName::BatteryEvent);
//! ```

pub use async_trait::async_trait;

pub mod bits;
pub mod channel;
pub mod codec;
pub mod config;
pub mod container;
pub mod dispatch;
pub mod event;
pub mod feature;
pub mod field;
pub mod formats;
#[cfg(test)]
mod mock;
pub mod nibble;
pub mod protocol;
pub mod report;
pub mod vlp;
