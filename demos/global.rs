//! Registering the allocator as the process-wide global allocator.

use tieralloc::TierAlloc;

#[global_allocator]
static ALLOCATOR: TierAlloc = TierAlloc;

fn main() {
    // Everything below allocates through TierAlloc.
    let nums: Vec<u64> = (0..1024).collect();
    assert_eq!(nums.iter().sum::<u64>(), 1024 * 1023 / 2);

    let text = String::from("all heap traffic goes through the tiers now");
    println!("{text}");

    let status = tieralloc::current_heap_status();
    println!(
        "live bytes: small {}, medium {}, large {}",
        status.small.current_bytes, status.medium.current_bytes, status.large.current_bytes
    );
}
