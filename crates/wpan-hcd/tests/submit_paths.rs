mod util;

use util::{bulk_out, sample_device, setup, Harness};
use wpan_hcd::usb::Direction;
use wpan_hcd::{HcdError, PortPhase, Urb};

#[test]
fn submit_to_absent_port_fails_without_giveback() {
    let h = Harness::new();
    let urb = bulk_out(5, 1, 16).into_handle();

    assert_eq!(h.hcd.submit(urb.clone()), Err(HcdError::NoDevice));
    h.hcd.run_deferred();

    assert_eq!(h.bus.giveback_count(), 0);
    assert_eq!(h.hcd.pending_urb_count(), 0);
    assert_eq!(h.hcd.link_pool().outstanding(), 0);
    assert!(!urb.is_linked());
}

#[test]
fn halted_controller_refuses_submissions() {
    let h = Harness::new();
    h.attach(1);
    h.hcd.stop();

    let urb = Urb::control(0, setup(0x00, 0x05, 3, 0, 0), Vec::new()).into_handle();
    assert_eq!(h.hcd.submit(urb), Err(HcdError::NoDevice));
}

#[test]
fn endpoint_number_out_of_range_is_invalid() {
    let h = Harness::new();
    h.attach(1);
    let urb = Urb::bulk(0, 16, Direction::Out, vec![0; 4]).into_handle();
    assert_eq!(h.hcd.submit(urb), Err(HcdError::InvalidRequest));
}

#[test]
fn set_address_and_get_configuration_are_answered_locally() {
    let h = Harness::new();
    let port = h.attach(7);
    assert_eq!(h.hcd.port_phase(port), Some(PortPhase::Present));

    h.set_address(9);
    assert_eq!(h.hcd.port_bus_address(port), Some(9));
    assert_eq!(h.hcd.port_phase(port), Some(PortPhase::Addressed));

    let get_config = h.submit(Urb::control(9, setup(0x80, 0x08, 0, 0, 1), Vec::new()));
    assert_eq!(h.bus.status_of(&get_config), Some(Ok(())));
    assert_eq!(get_config.actual_data(), vec![0]);

    let device = sample_device();
    assert_eq!(h.set_configuration(port, 9, &device, 1), Some(Ok(())));
    assert_eq!(h.hcd.port_phase(port), Some(PortPhase::Configured));

    let get_config = h.submit(Urb::control(9, setup(0x80, 0x08, 0, 0, 1), Vec::new()));
    assert_eq!(get_config.actual_data(), vec![1]);

    // Only SET_CONFIGURATION reached the peer.
    let forwarded = h.transport.control_requests();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].1.request, 0x09);
    assert_eq!(h.hcd.pending_urb_count(), 0);
}

#[test]
fn get_configuration_without_response_buffer_stalls() {
    let h = Harness::new();
    h.attach(1);
    h.set_address(2);

    let urb = h.submit(Urb::control(2, setup(0x80, 0x08, 0, 0, 0), Vec::new()));
    assert_eq!(h.bus.status_of(&urb), Some(Err(HcdError::BrokenPipe)));
}

#[test]
fn get_interface_without_response_buffer_stalls() {
    let h = Harness::new();
    h.enumerate(1, 3, &sample_device());
    let sent = h.transport.control_requests().len();

    let urb = h.submit(Urb::control(3, setup(0x81, 0x0a, 0, 1, 0), Vec::new()));
    assert_eq!(h.bus.status_of(&urb), Some(Err(HcdError::BrokenPipe)));
    assert!(urb.actual_data().is_empty());
    assert_eq!(h.transport.control_requests().len(), sent);
}

#[test]
fn get_interface_reports_cached_alternate_setting() {
    let h = Harness::new();
    let device = sample_device();
    let port = h.enumerate(1, 4, &device);

    let urb = h.submit(Urb::control(4, setup(0x81, 0x0a, 0, 1, 1), Vec::new()));
    assert_eq!(h.bus.status_of(&urb), Some(Ok(())));
    assert_eq!(urb.actual_data(), vec![0]);

    let set_alt = h.submit(
        Urb::control(4, setup(0x01, 0x0b, 1, 1, 0), Vec::new()).with_device(device.clone()),
    );
    h.hcd.control_confirm(port, h.transport.last_req_id(), 0, &[]);
    assert_eq!(h.bus.status_of(&set_alt), Some(Ok(())));
    assert!(h.hcd.has_endpoint(port, 0x03));
    assert!(h.hcd.has_endpoint(port, 0x84));
    assert_eq!(h.transport.streams_created(), vec![3]);

    let urb = h.submit(Urb::control(4, setup(0x81, 0x0a, 0, 1, 1), Vec::new()));
    assert_eq!(urb.actual_data(), vec![1]);

    // No such interface.
    let urb = h.submit(Urb::control(4, setup(0x81, 0x0a, 0, 5, 1), Vec::new()));
    assert_eq!(h.bus.status_of(&urb), Some(Err(HcdError::BrokenPipe)));
}

#[test]
fn urb_for_unbuilt_endpoint_completes_with_no_such_endpoint() {
    let h = Harness::new();
    h.attach(1);
    h.set_address(3);

    let urb = h.submit(bulk_out(3, 2, 8));
    assert_eq!(h.bus.status_of(&urb), Some(Err(HcdError::NoSuchEndpoint)));
    assert_eq!(h.hcd.pending_urb_count(), 0);
}

#[test]
fn interrupt_in_uses_buffered_data_before_queueing() {
    let h = Harness::new();
    let port = h.enumerate(1, 3, &sample_device());

    h.hcd.data_indication(port, 0x81, &[9, 8, 7]);
    assert_eq!(h.hcd.buffered_units(port, 0x81), Some(1));

    let first = h.submit(Urb::interrupt(3, 1, Direction::In, vec![0; 2]));
    assert_eq!(h.bus.status_of(&first), Some(Ok(())));
    assert_eq!(first.actual_data(), vec![9, 8]);
    assert_eq!(h.hcd.buffered_units(port, 0x81), Some(0));

    let second = h.submit(Urb::interrupt(3, 1, Direction::In, vec![0; 8]));
    assert_eq!(h.bus.status_of(&second), None);
    assert_eq!(h.hcd.queued_urbs(port, 0x81), Some(1));

    h.hcd.data_indication(port, 0x81, &[1, 2, 3]);
    assert_eq!(h.bus.status_of(&second), Some(Ok(())));
    assert_eq!(second.actual_data(), vec![1, 2, 3]);
    assert_eq!(h.hcd.link_pool().outstanding(), 0);
}

#[test]
fn bulk_in_data_without_waiting_urb_is_dropped() {
    let h = Harness::new();
    let port = h.enumerate(1, 3, &sample_device());

    h.hcd.data_indication(port, 0x82, &[1, 2, 3]);
    assert_eq!(h.hcd.buffered_units(port, 0x82), Some(0));

    let urb = h.submit(Urb::bulk(3, 2, Direction::In, vec![0; 4]));
    assert_eq!(h.bus.status_of(&urb), None);
    h.hcd.data_indication(port, 0x82, &[4, 5, 6, 7, 8, 9]);
    assert_eq!(urb.actual_data(), vec![4, 5, 6, 7]);
}

#[test]
fn frame_number_increases_monotonically() {
    let h = Harness::new();
    let a = h.hcd.get_frame_number();
    let b = h.hcd.get_frame_number();
    assert!(b > a);
}
