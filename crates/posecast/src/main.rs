fn main() {
  if let Err(err) = posecast::run() {
    eprintln!("error: {err:#}");
    std::process::exit(1);
  }
}
