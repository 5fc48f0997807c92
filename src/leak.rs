//! Shutdown leak report (`report-leaks` feature).
//!
//! Walks every super-pool header by header, descending into small-block
//! pools, then the large block list, and writes one line per block that is
//! still allocated. Runs after the deferred stacks were drained and before
//! anything is unmapped; the process continues shutting down normally
//! afterwards.

use crate::{large, medium, small};

pub(crate) unsafe fn report_leaks() {
    let mut leaked = 0usize;

    for namespace in 0..medium::MEDIUM_NAMESPACES {
        medium::walk_allocated(namespace, |block| {
            if block.hosts_small_pool {
                small::walk_pool(block.user, |user, block_size| {
                    eprintln!(
                        "tieralloc: leaked small block at {:p} ({} bytes)",
                        user.as_ptr(),
                        block_size
                    );
                    leaked += 1;
                });
            } else {
                eprintln!(
                    "tieralloc: leaked medium block at {:p} ({} bytes)",
                    block.user.as_ptr(),
                    block.size
                );
                leaked += 1;
            }
        });
    }

    large::walk_allocated(|user, size| {
        eprintln!(
            "tieralloc: leaked large block at {:p} ({} bytes)",
            user.as_ptr(),
            size
        );
        leaked += 1;
    });

    if leaked > 0 {
        eprintln!("tieralloc: {leaked} block(s) still allocated at shutdown");
    }
}
