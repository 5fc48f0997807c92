//! Using the allocator directly through its native entry points.

use tieralloc::SmallBlockOrder;

fn main() {
    tieralloc::init();

    // Small block.
    let mut p = tieralloc::alloc(40);
    assert!(!p.is_null());
    unsafe {
        p.write_bytes(0xAA, 40);
        println!("small block: {p:p}, usable {}", tieralloc::size_of(p));
    }

    // Grow it across classes and tiers.
    for size in [200usize, 10_000, 1_000_000] {
        unsafe {
            tieralloc::realloc(&mut p, size);
        }
        println!("grown to {size}: {p:p}, usable {}", unsafe {
            tieralloc::size_of(p)
        });
    }

    unsafe {
        let nominal = tieralloc::free(p);
        println!("freed, nominal size {nominal}");
    }

    let status = tieralloc::current_heap_status();
    println!(
        "cumulative: small {} B, medium {} B, large {} B",
        status.small.cumulative_bytes, status.medium.cumulative_bytes, status.large.cumulative_bytes
    );

    for row in tieralloc::small_block_status(8, SmallBlockOrder::TotalAllocations) {
        println!(
            "class {:>5}: {:>6} total, {:>6} live",
            row.block_size, row.total, row.current
        );
    }

    tieralloc::shutdown();
}
