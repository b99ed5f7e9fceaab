//! Integration tests for the mock platform through the trait objects

use relay_platform::mock::MockPlatform;
use relay_platform::*;

/// The bundled platform and the concrete mocks observe the same state
#[test]
fn test_platform_shares_mock_state() {
    let mock = MockPlatform::new();
    let platform = mock.platform();

    let pid = mock.tasks.spawn_process();
    let task = mock.tasks.spawn_task(pid);
    mock.tasks.set_credentials(pid, Credentials { uid: 1000, gid: 100 });

    assert_eq!(platform.tasks.process_of(task), Some(pid));
    assert!(platform.tasks.is_alive(task));
    assert_eq!(
        platform.tasks.credentials(pid),
        Some(Credentials { uid: 1000, gid: 100 })
    );

    let region = platform.pages.alloc_region(2, 4096).unwrap();
    for (i, frame) in region.frames().iter().enumerate() {
        platform
            .pages
            .map_user_page(pid, 0x1000_0000 + i * 4096, *frame)
            .unwrap();
    }
    assert_eq!(mock.memory.live_frames(), 2);
    assert_eq!(mock.memory.mapped_pages(pid), 2);

    for i in 0..2 {
        platform.pages.unmap_user_page(pid, 0x1000_0000 + i * 4096);
    }
    platform.pages.free_region(region);
    assert_eq!(mock.memory.live_frames(), 0);
    assert_eq!(mock.memory.mapped_pages(pid), 0);
}

/// Duplicated descriptors land in the lowest free slot of the destination
#[test]
fn test_descriptor_duplication() {
    let mock = MockPlatform::new();
    let platform = mock.platform();
    let a = mock.tasks.spawn_process();
    let b = mock.tasks.spawn_process();

    let fd = mock.descriptors.open(a).unwrap();
    mock.descriptors.open(b).unwrap();

    let dup = platform.descriptors.dup_into(a, fd, b).unwrap();
    assert_eq!(dup, 1);
    assert_eq!(mock.descriptors.open_count(b), 2);
}

/// User copies honour the registered ranges and the advanceable clock
#[test]
fn test_user_memory_and_clock() {
    let mock = MockPlatform::new();
    let platform = mock.platform();
    let pid = mock.tasks.spawn_process();

    mock.user.map(pid, 0x8000, b"hello".to_vec());
    assert_eq!(platform.user.copy_from_user(pid, 0x8000, 5).unwrap(), b"hello");
    assert_eq!(
        platform.user.copy_from_user(pid, 0x8000, 6),
        Err(PlatformError::BadAddress { addr: 0x8000, len: 6 })
    );

    let before = platform.clock.now_nanos();
    mock.clock.advance(std::time::Duration::from_secs(1));
    assert_eq!(platform.clock.now_nanos(), before + 1_000_000_000);
}
