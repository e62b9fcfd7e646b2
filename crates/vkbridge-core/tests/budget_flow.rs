//! Mapping and staging budgets across reserve, exhaust, and release.

use ash::vk;
use vkbridge_core::map_budget::{MapLedger, UnmapAction};
use vkbridge_core::memory_props::StagingLedger;

const MIB: u64 = 1 << 20;

#[test]
fn test_map_budget_exhaustion_falls_back_to_scratch() {
    let ledger = MapLedger::new(MIB, MIB, 512);

    assert!(ledger.try_reserve(1, 800 * 1024));
    assert!(!ledger.try_reserve(2, 400 * 1024));

    let ptr = ledger.map_fake(2, 400 * 1024).expect("scratch mapping");
    assert!(!ptr.is_null());
    assert_eq!(ledger.fake_live(), 1);

    // A redirected request wider than the scratch region fails rather
    // than handing out a pointer it would overrun.
    assert_eq!(
        ledger.map_fake(3, 2 * MIB),
        Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
    );
    assert_eq!(ledger.fake_live(), 1);

    // Retiring the scratch mapping must not reach the driver.
    assert_eq!(ledger.unmap(2), UnmapAction::DropFake);
    assert_eq!(ledger.fake_live(), 0);

    // The real mapping's budget is returned on unmap, so the request
    // that failed before now fits.
    assert_eq!(ledger.unmap(1), UnmapAction::RealUnmap);
    assert!(ledger.try_reserve(2, 400 * 1024));
}

#[test]
fn test_whole_size_is_booked_at_nominal() {
    let ledger = MapLedger::new(MIB, 4096, 512);
    assert!(ledger.try_reserve(1, vk::WHOLE_SIZE));
    assert_eq!(ledger.real_bytes(), 512);
    assert_eq!(ledger.unmap(1), UnmapAction::RealUnmap);
    assert_eq!(ledger.real_bytes(), 0);
}

#[test]
fn test_untracked_unmap_still_forwards() {
    let ledger = MapLedger::new(MIB, 4096, 512);
    assert_eq!(ledger.unmap(99), UnmapAction::Untracked);
}

#[test]
fn test_staging_preflight_rekey_and_release() {
    let staging = StagingLedger::new(2 * MIB);
    let preflight = 1u64 << 63;

    staging.reserve(preflight, MIB).expect("within budget");
    assert_eq!(staging.total(), MIB);

    // The allocation succeeded; the reservation follows the handle.
    staging.rekey(preflight, 0x4000);
    assert_eq!(staging.total(), MIB);

    // A second allocation that would overflow fails preflight cleanly.
    assert!(staging.reserve(preflight | 1, 2 * MIB).is_err());
    assert_eq!(staging.total(), MIB);

    staging.release(0x4000);
    assert_eq!(staging.total(), 0);
    staging.reserve(preflight | 1, 2 * MIB).expect("budget freed");
}
