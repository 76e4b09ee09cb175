fn main() {
    // Rebuild when kernel sources change
    println!("cargo:rerun-if-changed=src/");
}
