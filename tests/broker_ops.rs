// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Exercise process-server bring-up and capability brokering on the host kernel.
// Author: Lukas Bower
#![cfg(feature = "std")]

use procserv::host::{HostBootstrap, HostMachine, HostObject};
use procserv::{
    cap_or_null, Badge, CapRights, Capability, KernelError, ProcServer, ProcservConfig,
    ProcservError, SlotAllocator,
};

const UART_BASE: usize = 0x1000_0000;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn server_with(machine: HostMachine) -> ProcServer<HostBootstrap> {
    init_logging();
    let mut boot = HostBootstrap::new(machine);
    ProcServer::initialise(&mut boot, ProcservConfig::default()).expect("server ready")
}

fn server() -> ProcServer<HostBootstrap> {
    server_with(HostMachine::default().with_device(UART_BASE, 12))
}

#[test]
fn initialise_runs_stages_in_order() {
    init_logging();
    let mut boot = HostBootstrap::new(HostMachine::default());
    let server = ProcServer::initialise(&mut boot, ProcservConfig::default()).unwrap();

    assert_eq!(
        boot.stages(),
        ["allocator", "virtual-pool", "platform", "registries"]
    );
    assert!(server.registries().initialised);
    assert!(server.irq_handlers().is_empty());
    assert!(matches!(
        server.kernel().object(server.endpoint()),
        Some(HostObject::Endpoint { .. })
    ));
    assert_ne!(server.recv_path().index, server.endpoint().cptr());
    assert_eq!(server.kernel().calls().endpoint_create, 1);
}

#[test]
fn initialise_fails_without_room_for_recv_slot() {
    init_logging();
    let mut boot = HostBootstrap::new(HostMachine::default().with_empty_slots(1));
    let result = ProcServer::initialise(&mut boot, ProcservConfig::default());
    assert!(matches!(result, Err(ProcservError::OutOfCapabilitySpace)));
    assert_eq!(boot.stages(), ["allocator", "virtual-pool", "platform"]);
}

#[test]
fn minted_badges_are_distinct_derivations_of_the_endpoint() {
    let mut server = server();
    let before = server.slots().free_count();

    let first = server.mint_badge(Badge::new(0x11)).unwrap();
    let second = server.mint_badge(Badge::new(0x22)).unwrap();
    let again = server.mint_badge(Badge::new(0x11)).unwrap();

    assert_ne!(first, second);
    assert_ne!(first, again);
    assert_eq!(server.slots().free_count(), before - 3);

    let Some(HostObject::Endpoint { id }) = server.kernel().object(server.endpoint()) else {
        panic!("main endpoint missing");
    };
    assert_eq!(
        server.kernel().object(second),
        Some(HostObject::MintedEndpoint {
            id,
            badge: Badge::new(0x22),
            rights: CapRights::GRANT_WRITE,
        })
    );
}

#[test]
fn mint_without_free_slot_returns_null_and_leaks_nothing() {
    let mut server = server();
    let before = server.slots().free_count();
    server.slots_mut().fail_after(0);

    let result = server.mint_badge(Badge::new(7));
    assert_eq!(result, Err(ProcservError::OutOfCapabilitySpace));
    assert_eq!(cap_or_null(result), Capability::NULL);
    assert_eq!(server.slots().free_count(), before);
    assert_eq!(server.kernel().calls().mint, 0);
}

#[test]
fn mint_fails_once_the_slot_ceiling_is_reached() {
    let mut server = server();
    server.slots_mut().fail_after(2);

    assert!(server.mint_badge(Badge::new(1)).is_ok());
    assert!(server.mint_badge(Badge::new(2)).is_ok());
    let before = server.slots().free_count();
    let mints = server.kernel().calls().mint;

    assert_eq!(cap_or_null(server.mint_badge(Badge::new(3))), Capability::NULL);
    assert_eq!(server.slots().free_count(), before);
    assert_eq!(server.kernel().calls().mint, mints);
}

#[test]
fn refused_mint_rolls_back_its_slot() {
    let mut server = server();
    let before = server.slots().free_count();
    let installed = server.kernel().installed();
    server
        .kernel_mut()
        .fail_mint(Some(KernelError::NotEnoughMemory));

    let result = server.mint_badge(Badge::new(7));
    assert_eq!(
        result,
        Err(ProcservError::KernelRejected(KernelError::NotEnoughMemory))
    );
    assert_eq!(server.slots().free_count(), before);
    assert_eq!(server.kernel().installed(), installed);

    server.kernel_mut().fail_mint(None);
    assert!(server.mint_badge(Badge::new(7)).is_ok());
}

#[test]
fn irq_handler_is_created_once_per_line() {
    let mut server = server();
    let before = server.slots().free_count();

    let first = server.get_irq_handler(33).unwrap();
    let second = server.get_irq_handler(33).unwrap();
    assert_eq!(first, second);
    assert_eq!(server.kernel().calls().irq_control_get, 1);
    assert_eq!(server.slots().free_count(), before - 1);
    assert_eq!(server.kernel().object(first), Some(HostObject::IrqHandler(33)));

    let other = server.get_irq_handler(34).unwrap();
    assert_ne!(other, first);
    assert_eq!(server.irq_handlers().len(), 2);
}

#[test]
fn irq_failure_leaves_cache_unchanged_and_allows_retry() {
    let mut server = server();
    let before = server.slots().free_count();
    server.kernel_mut().reject_irq(9);

    assert_eq!(
        server.get_irq_handler(9),
        Err(ProcservError::KernelRejected(KernelError::RangeError))
    );
    assert!(server.irq_handlers().get(9).is_none());
    assert_eq!(server.slots().free_count(), before);

    server.kernel_mut().accept_irq(9);
    let handler = server.get_irq_handler(9).unwrap();
    assert_eq!(server.irq_handlers().get(9), Some(handler));
}

#[test]
fn irq_without_free_slot_is_not_cached() {
    let mut server = server();
    server.slots_mut().fail_after(0);
    assert_eq!(
        server.get_irq_handler(4),
        Err(ProcservError::OutOfCapabilitySpace)
    );
    assert!(server.irq_handlers().is_empty());
    assert_eq!(server.kernel().calls().irq_control_get, 0);
}

#[test]
fn find_device_resolves_exported_region() {
    let mut server = server();
    let before = server.slots().free_count();

    let cap = server.find_device(UART_BASE, 4096).unwrap();
    assert!(!cap.is_null());
    assert_eq!(
        server.kernel().object(cap),
        Some(HostObject::DeviceFrame {
            paddr: UART_BASE,
            size_bits: 12,
        })
    );
    assert_eq!(server.slots().free_count(), before - 1);

    let again = server.find_device(UART_BASE, 4096).unwrap();
    assert_ne!(again, cap);
    assert_eq!(server.kernel().calls().copy, 2);
    assert_eq!(server.device_coverage(UART_BASE, 12).unwrap().lookups, 2);
}

#[test]
fn find_device_resolves_pages_inside_a_larger_region() {
    let mut server = server_with(HostMachine::default().with_device(UART_BASE, 16));

    let page = server.find_device(UART_BASE + 0x1000, 4096).unwrap();
    assert_eq!(
        server.kernel().object(page),
        Some(HostObject::DeviceFrame {
            paddr: UART_BASE + 0x1000,
            size_bits: 12,
        })
    );
    let last = server.find_device(UART_BASE + 0xf000, 4096).unwrap();
    assert_eq!(
        server.kernel().object(last),
        Some(HostObject::DeviceFrame {
            paddr: UART_BASE + 0xf000,
            size_bits: 12,
        })
    );
    assert_eq!(server.device_coverage(UART_BASE, 16).unwrap().lookups, 2);

    let before = server.slots().free_count();
    assert_eq!(
        server.find_device(UART_BASE + 0x800, 4096),
        Err(ProcservError::NotFound {
            paddr: UART_BASE + 0x800,
            size_bits: 12,
        })
    );
    assert_eq!(server.slots().free_count(), before);
}

#[test]
fn find_device_honours_the_exported_frame_width() {
    let mut server =
        server_with(HostMachine::default().with_device_frames(UART_BASE, 16, 16));

    let whole = server.find_device(UART_BASE, 1 << 16).unwrap();
    assert_eq!(
        server.kernel().object(whole),
        Some(HostObject::DeviceFrame {
            paddr: UART_BASE,
            size_bits: 16,
        })
    );
    assert!(server.find_device(UART_BASE + 0x1000, 4096).is_err());
}

#[test]
fn find_device_without_backing_region_returns_null() {
    let mut server = server();
    let before = server.slots().free_count();

    let result = server.find_device(0x2000_0000, 4096);
    assert_eq!(
        result,
        Err(ProcservError::NotFound {
            paddr: 0x2000_0000,
            size_bits: 12,
        })
    );
    assert_eq!(cap_or_null(result), Capability::NULL);
    assert_eq!(server.slots().free_count(), before);
}

#[test]
fn find_device_rejects_sizes_before_taking_a_slot() {
    let mut server = server();
    let before = server.slots().free_count();

    for size in [0usize, 3000, 4097] {
        assert_eq!(
            server.find_device(UART_BASE, size),
            Err(ProcservError::InvalidSize(size))
        );
    }
    assert_eq!(server.slots().free_count(), before);
    assert_eq!(server.kernel().calls().copy, 0);
}

#[test]
fn release_cap_deletes_and_recycles_the_slot() {
    let mut server = server();
    let before = server.slots().free_count();
    let cap = server.mint_badge(Badge::new(1)).unwrap();

    server.release_cap(cap).unwrap();
    assert_eq!(server.kernel().object(cap), None);
    assert_eq!(server.slots().free_count(), before);
    assert_eq!(server.mint_badge(Badge::new(2)), Ok(cap));

    assert_eq!(
        server.release_cap(Capability::NULL),
        Err(ProcservError::NullCapability)
    );
    assert_eq!(server.kernel().calls().delete, 1);
}

#[test]
fn release_cap_refuses_the_main_endpoint() {
    let mut server = server();
    let endpoint = server.endpoint();

    assert_eq!(
        server.release_cap(endpoint),
        Err(ProcservError::ServerOwned(endpoint))
    );
    assert!(matches!(
        server.kernel().object(endpoint),
        Some(HostObject::Endpoint { .. })
    ));
    assert!(server.mint_badge(Badge::new(6)).is_ok());
    assert_eq!(server.kernel().calls().delete, 0);
}

#[test]
fn release_cap_refuses_the_receive_slot() {
    let mut server = server();
    let before = server.slots().free_count();
    let recv = server.recv_path().cap();

    assert_eq!(server.release_cap(recv), Err(ProcservError::ServerOwned(recv)));
    assert_eq!(server.slots().free_count(), before);
}

#[test]
fn release_cap_refuses_cached_irq_handlers() {
    let mut server = server();
    let handler = server.get_irq_handler(33).unwrap();

    assert_eq!(
        server.release_cap(handler),
        Err(ProcservError::ServerOwned(handler))
    );
    server.mint_badge(Badge::new(5)).unwrap();
    assert_eq!(server.get_irq_handler(33), Ok(handler));
    assert_eq!(server.kernel().object(handler), Some(HostObject::IrqHandler(33)));
    assert_eq!(server.kernel().calls().irq_control_get, 1);
}

#[test]
fn release_cap_refuses_boot_device_frames() {
    let mut server = server();
    let region = server.platform().regions()[0];

    assert_eq!(
        server.release_cap(region.first_frame),
        Err(ProcservError::ServerOwned(region.first_frame))
    );
    let copy = server.find_device(UART_BASE, 4096).unwrap();
    server.release_cap(copy).unwrap();
    assert!(server.find_device(UART_BASE, 4096).is_ok());
}

#[test]
fn fake_time_advances_and_snapshot_tracks_usage() {
    let mut server = server();
    assert_eq!(server.fake_time(), 0);
    assert_eq!(server.fake_time(), 1);

    server.get_irq_handler(1).unwrap();
    let snapshot = server.snapshot();
    assert_eq!(snapshot.fake_time, 2);
    assert_eq!(snapshot.irq_handlers, 1);
    assert_eq!(snapshot.endpoint, server.endpoint());
    assert_eq!(snapshot.cspace_free, server.slots().free_count());

    assert_eq!(server.unblock_client_fault_pid(), None);
    server.set_unblock_client_fault_pid(Some(4));
    assert_eq!(server.unblock_client_fault_pid(), Some(4));
}
