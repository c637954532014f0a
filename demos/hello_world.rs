use region_malloc::UnixAllocator;

#[global_allocator]
static A: UnixAllocator = UnixAllocator::new();

fn main() {
    let greeting = String::from("Hello, World!");
    println!("{}", greeting);
}
