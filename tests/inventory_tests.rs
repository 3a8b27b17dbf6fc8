// Integration tests for the guest inventory
mod common;

use common::*;
use kvmove::guest::DiskBackend;
use kvmove::inventory::InventoryBuilder;
use kvmove::storage::{LvmBackend, StorageAdapter};
use pretty_assertions::assert_eq;

fn storage() -> StorageAdapter {
    StorageAdapter::new(LvmBackend::new("ubuntu-vg", 4 << 20))
}

fn host_with_two_guests(events: &EventLog) -> (FakeHypervisor, FakeHost) {
    let hypervisor = FakeHypervisor::new("local", events.clone())
        .with_guest(
            "web2",
            domain_xml("web2", &[("/dev/ubuntu-vg/web2", DiskBackend::LogicalVolume)]),
            true,
        )
        .with_guest(
            "db1",
            domain_xml(
                "db1",
                &[
                    ("/dev/ubuntu-vg/db1", DiskBackend::LogicalVolume),
                    ("/var/lib/libvirt/images/db1-scratch.qcow2", DiskBackend::CopyOnWrite),
                ],
            ),
            false,
        );
    let runner = FakeHost::new("local", events.clone())
        .with_volume("/dev/ubuntu-vg/web2", TEN_GIB)
        .with_volume("/dev/ubuntu-vg/db1", 20 << 30)
        .with_volume("/var/lib/libvirt/images/db1-scratch.qcow2", 8 << 30);
    (hypervisor, runner)
}

#[tokio::test]
async fn test_inventory_describes_every_guest() {
    let events = EventLog::default();
    let (hypervisor, runner) = host_with_two_guests(&events);
    let storage = storage();

    let inventory = InventoryBuilder::new(&hypervisor, &storage, &runner)
        .build()
        .await
        .unwrap();

    assert_eq!(inventory.keys().collect::<Vec<_>>(), vec!["db1", "web2"]);

    let db1 = &inventory["db1"];
    assert_eq!(db1.vcpus, 2);
    assert_eq!(db1.memory_bytes, 2 << 30);
    assert_eq!(db1.vnc_port, Some(5901));
    assert_eq!(db1.disks.len(), 2);
    assert_eq!(db1.disks[0].size_bytes, 20 << 30);
    assert_eq!(db1.disks[1].backend, DiskBackend::CopyOnWrite);
    assert_eq!(db1.disks[1].size_bytes, 8 << 30);
    assert_eq!(db1.total_disk_bytes(), 28 << 30);

    assert_eq!(inventory["web2"].disks[0].size_bytes, TEN_GIB);
    assert!(events.events().is_empty(), "inventory must not change anything");
}

#[tokio::test]
async fn test_inventory_is_idempotent() {
    let events = EventLog::default();
    let (hypervisor, runner) = host_with_two_guests(&events);
    let storage = storage();
    let builder = InventoryBuilder::new(&hypervisor, &storage, &runner);

    let first = builder.build().await.unwrap();
    let second = builder.build().await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn test_empty_host_yields_empty_inventory() {
    let events = EventLog::default();
    let hypervisor = FakeHypervisor::new("local", events.clone());
    let runner = FakeHost::new("local", events);
    let storage = storage();

    let inventory = InventoryBuilder::new(&hypervisor, &storage, &runner)
        .build()
        .await
        .unwrap();

    assert!(inventory.is_empty());
}

#[tokio::test]
async fn test_missing_volume_is_listed_with_zero_size() {
    let events = EventLog::default();
    let hypervisor = FakeHypervisor::new("local", events.clone()).with_guest(
        "web2",
        domain_xml("web2", &[("/dev/ubuntu-vg/web2", DiskBackend::LogicalVolume)]),
        false,
    );
    let runner = FakeHost::new("local", events);
    let storage = storage();

    let guest = InventoryBuilder::new(&hypervisor, &storage, &runner)
        .describe("web2")
        .await
        .unwrap();

    assert_eq!(guest.disks.len(), 1);
    assert_eq!(guest.disks[0].size_bytes, 0);
    assert!(!guest.disks[0].is_known());
}

#[tokio::test]
async fn test_unknown_guest_is_not_found() {
    let events = EventLog::default();
    let (hypervisor, runner) = host_with_two_guests(&events);
    let storage = storage();

    let err = InventoryBuilder::new(&hypervisor, &storage, &runner)
        .describe("ghost")
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), 3);
}
