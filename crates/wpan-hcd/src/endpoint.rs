//! Per-direction endpoint state: the URB queue, the optional data ring and isochronous pacing.

use crate::config::HcdConfig;
use crate::pool::{LinkBox, LinkLocation, LinkQueue, UrbLink};
use crate::ring::{DataRing, RingError};
use crate::urb::{Urb, UrbHandle};
use crate::usb::{endpoint_address, Direction, EndpointDescriptor, TransferType};

const NS_PER_MS: u64 = 1_000_000;

/// Packets delivered on an isochronous IN endpoint between two drift traces.
const DRIFT_TRACE_PERIOD: i32 = 1000;

#[derive(Debug)]
pub(crate) struct Endpoint {
    pub(crate) number: u8,
    pub(crate) direction: Direction,
    pub(crate) transfer_type: TransferType,
    pub(crate) urbs: LinkQueue,
    pub(crate) ring: Option<DataRing>,
    /// Isochronous credit in packets; `None` while the endpoint is idle.
    pub(crate) credit: Option<i32>,
    credit_timestamp_ns: u64,
    /// Packets delivered since the last drift trace. Diagnostics only.
    credit2: i32,
    credit_ceiling: i32,
    pub(crate) buffering: bool,
    pub(crate) max_buffer_units: usize,
    pub(crate) start_frame: u32,
    pub(crate) has_stream: bool,
}

impl Endpoint {
    fn new(port: usize, number: u8, direction: Direction, transfer_type: TransferType) -> Self {
        Self {
            number,
            direction,
            transfer_type,
            urbs: LinkQueue::new(LinkLocation::Endpoint {
                port,
                endpoint: endpoint_address(number, direction),
            }),
            ring: None,
            credit: None,
            credit_timestamp_ns: 0,
            credit2: 0,
            credit_ceiling: 0,
            buffering: false,
            max_buffer_units: 0,
            start_frame: 0,
            has_stream: false,
        }
    }

    /// Endpoint 0. Control requests awaiting a peer confirmation queue here keyed by request id.
    pub(crate) fn control(port: usize) -> Self {
        Self::new(port, 0, Direction::Out, TransferType::Control)
    }

    pub(crate) fn from_descriptor(
        port: usize,
        desc: &EndpointDescriptor,
        config: &HcdConfig,
        max_buffer_units: u8,
        has_stream: bool,
    ) -> Self {
        let direction = desc.direction();
        let transfer_type = desc.transfer_type();
        let mut ep = Self::new(port, desc.number(), direction, transfer_type);
        if direction.is_in() {
            ep.ring = match transfer_type {
                TransferType::Isochronous => Some(DataRing::new(config.isoc_buffer_size)),
                TransferType::Interrupt => Some(DataRing::new(config.interrupt_buffer_size)),
                _ => None,
            };
        }
        if transfer_type == TransferType::Isochronous {
            ep.credit_ceiling = config.isoc_credit_ceiling;
            if direction.is_in() {
                ep.max_buffer_units = usize::from(max_buffer_units);
                ep.buffering = true;
            } else {
                ep.has_stream = has_stream;
            }
        }
        ep
    }

    pub(crate) fn address(&self) -> u8 {
        endpoint_address(self.number, self.direction)
    }

    pub(crate) fn is_isochronous(&self) -> bool {
        self.transfer_type == TransferType::Isochronous
    }

    pub(crate) fn buffered_units(&self) -> usize {
        self.ring.as_ref().map_or(0, DataRing::buffered_units)
    }

    /// Starts OUT credit accounting the first time an URB is queued on an idle endpoint.
    pub(crate) fn activate_out_credit(&mut self, now_ns: u64) {
        if self.credit.is_none() {
            self.credit = Some(0);
            self.credit_timestamp_ns = now_ns;
        }
    }

    /// Detaches `urb` from the queue. Isochronous URBs hand their packets back from the credit.
    pub(crate) fn remove_urb(&mut self, urb: &UrbHandle) -> Option<LinkBox> {
        let link = self.urbs.remove_urb(urb)?;
        if self.is_isochronous() {
            if let Some(credit) = self.credit.as_mut() {
                *credit = credit.saturating_sub(packets_of(&link)).max(0);
            }
        }
        Some(link)
    }

    /// Completes `urb` from the oldest buffered unit, if any. Used for interrupt IN endpoints that
    /// received data before an URB was waiting.
    pub(crate) fn complete_from_ring(&mut self, urb: &Urb) -> bool {
        let Some(ring) = self.ring.as_mut() else {
            return false;
        };
        if ring.is_empty() {
            return false;
        }
        let mut inner = urb.lock();
        let limit = inner.transfer_buffer_length.min(inner.buffer.len());
        let copied = ring.read_unit_into(&mut inner.buffer[..limit]).unwrap_or(0);
        inner.actual_length = copied;
        true
    }

    /// Buffers interrupt IN data that arrived with no URB waiting.
    pub(crate) fn buffer_data(&mut self, data: &[u8]) {
        let ep = self.address();
        let Some(ring) = self.ring.as_mut() else {
            tracing::warn!(ep, len = data.len(), "no URB waiting and no buffer; data dropped");
            return;
        };
        if let Err(err) = ring.write_unit(data) {
            tracing::warn!(
                ep,
                len = data.len(),
                units = ring.buffered_units(),
                %err,
                "IN data dropped"
            );
        }
    }

    /// Buffers isochronous IN data, discarding the oldest units when the ring overflows.
    pub(crate) fn buffer_isoc_in(&mut self, data: &[u8]) {
        let ep = self.address();
        let max_units = self.max_buffer_units;
        let Some(ring) = self.ring.as_mut() else {
            return;
        };
        match ring.write_unit(data) {
            Ok(()) => {}
            Err(RingError::UnitTooLarge) => {
                tracing::warn!(ep, len = data.len(), "isochronous unit too large; dropped");
            }
            Err(RingError::Full) => {
                let mut dropped = 0usize;
                while !ring.is_empty()
                    && (ring.free_space() < data.len() + 1 || ring.buffered_units() >= max_units)
                {
                    ring.skip_unit();
                    dropped += 1;
                }
                let stored = ring.write_unit(data).is_ok();
                tracing::debug!(ep, dropped, stored, "isochronous IN overflow");
            }
        }
    }

    /// Accrues OUT credit for the time elapsed since the last tick and releases the URBs it covers.
    ///
    /// An URB is released when its packet count is at most `credit + 1`; credit never drops below
    /// zero.
    pub(crate) fn release_out_isoc(&mut self, now_ns: u64, out: &mut Vec<LinkBox>) {
        let Some(credit) = self.credit else {
            return;
        };
        let elapsed_ms = now_ns.saturating_sub(self.credit_timestamp_ns) / NS_PER_MS;
        let accrued =
            i64::from(credit).saturating_add(i64::try_from(elapsed_ms).unwrap_or(i64::MAX));
        let mut credit = if accrued >= i64::from(self.credit_ceiling) {
            self.credit_timestamp_ns = now_ns;
            self.credit_ceiling
        } else {
            // Only whole milliseconds are consumed; the remainder carries into the next tick.
            self.credit_timestamp_ns += elapsed_ms * NS_PER_MS;
            i32::try_from(accrued).unwrap_or(i32::MAX)
        };

        while credit > 0 {
            let Some(front) = self.urbs.front() else {
                break;
            };
            let packets = packets_of(front);
            if credit.saturating_add(1) < packets {
                break;
            }
            credit = credit.saturating_sub(packets).max(0);
            if let Some(link) = self.urbs.pop_front() {
                out.push(link);
            }
        }
        self.credit = Some(credit);
    }

    /// Runs one tick of isochronous IN delivery.
    ///
    /// While buffering, nothing is delivered until `max_buffer_units` units have accumulated. Once
    /// streaming, whole URBs are filled from the ring as long as it holds enough units; an empty
    /// ring puts the endpoint back into buffering.
    pub(crate) fn service_in_isoc(
        &mut self,
        now_ns: u64,
        rounding_ns: u64,
        out: &mut Vec<LinkBox>,
    ) {
        let ep = self.address();
        if self.buffering {
            if self.buffered_units() >= self.max_buffer_units {
                tracing::trace!(ep, units = self.buffered_units(), "isochronous IN streaming");
                self.buffering = false;
                self.credit = Some(0);
                self.credit2 = 0;
                self.credit_timestamp_ns = now_ns;
                self.start_frame = 0;
            }
            return;
        }

        let elapsed = now_ns.saturating_sub(self.credit_timestamp_ns) + rounding_ns;
        let elapsed_ms = i32::try_from(elapsed / NS_PER_MS).unwrap_or(i32::MAX);
        let mut credit = self.credit.unwrap_or(0).saturating_add(elapsed_ms);
        self.credit_timestamp_ns = now_ns;

        let Some(ring) = self.ring.as_mut() else {
            self.credit = Some(credit);
            return;
        };
        while let Some(front) = self.urbs.front() {
            let packets = packets_of(front);
            if ring.buffered_units() < usize::try_from(packets).unwrap_or(usize::MAX) {
                break;
            }
            let Some(link) = self.urbs.pop_front() else {
                break;
            };
            if let Some(urb) = &link.urb {
                fill_from_ring(ring, urb, self.start_frame);
            }
            self.start_frame = self.start_frame.wrapping_add(packets.unsigned_abs());
            credit = credit.saturating_sub(packets);
            self.credit2 = self.credit2.saturating_add(packets);
            out.push(link);
        }
        self.credit = Some(credit);

        let units = ring.buffered_units();
        if units == 0 {
            tracing::debug!(ep, "isochronous IN underrun");
            self.buffering = true;
            return;
        }
        if self.credit2 >= DRIFT_TRACE_PERIOD {
            tracing::trace!(ep, delivered = self.credit2, credit, units, "isochronous IN drift");
            self.credit2 = 0;
        }
    }

    /// Detaches control requests whose resend counter passed `threshold` and advances every other
    /// armed counter.
    pub(crate) fn take_timed_out(&mut self, threshold: u32) -> Vec<LinkBox> {
        let expired = self.urbs.take_where(|link| link.submit_counter > threshold);
        for link in self.urbs.iter_mut() {
            if link.submit_counter != 0 {
                link.submit_counter += 1;
            }
        }
        expired
    }
}

fn packets_of(link: &UrbLink) -> i32 {
    link.urb.as_ref().map_or(0, |urb| {
        i32::try_from(urb.number_of_packets()).unwrap_or(i32::MAX)
    })
}

/// Fills every packet of `urb` with one unit from `ring`, packed back to back.
fn fill_from_ring(ring: &mut DataRing, urb: &Urb, start_frame: u32) {
    let mut guard = urb.lock();
    let inner = &mut *guard;
    let mut actual = 0;
    for packet in inner.iso_packets.iter_mut() {
        let start = actual.min(inner.buffer.len());
        let len = ring.read_unit_into(&mut inner.buffer[start..]).unwrap_or(0);
        packet.offset = actual;
        packet.actual_length = len;
        packet.status = Ok(());
        actual += len;
    }
    inner.actual_length = actual;
    inner.error_count = 0;
    inner.start_frame = start_frame;
}
