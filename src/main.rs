fn main() {
    if let Err(err) = site_ingest::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
