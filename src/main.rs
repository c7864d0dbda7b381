fn main() {
    if let Err(e) = edgecast_lib::run() {
        log::error!("[App] {:#}", e);
        eprintln!("edgecast: {:#}", e);
        std::process::exit(1);
    }
}
