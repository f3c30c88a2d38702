fn main() {
    if let Err(e) = picall_desktop::run() {
        eprintln!("picall: {e}");
        std::process::exit(1);
    }
}
