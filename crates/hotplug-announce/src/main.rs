use anyhow::Result;

mod app;
#[cfg(unix)]
mod signals;

fn main() -> Result<()> {
  app::run()
}
