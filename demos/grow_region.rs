//! This is a very minimal example to show using a RegionSource directly.

use region_malloc::allocators::{PlatformSource, RegionSource};

fn main() {
    let mut source = PlatformSource::default();
    println!("Page size: {}", source.page_size());

    let (p, sz) = unsafe { source.acquire(8).unwrap() };
    println!("Returned: ({:p}={}, {})", p, p.as_ptr() as usize, sz);

    unsafe { source.release(p, sz).unwrap() };
    println!(
        "Acquisitions: {}, releases: {}",
        source.acquisitions, source.releases
    );
}
