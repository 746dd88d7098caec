fn main() {
    // Build date and time are reported by the `V` command
    built::write_built_file().expect("Failed to acquire build-time information");
}
