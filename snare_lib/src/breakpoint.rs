use std::io::{self, BufRead, Write};

use log::info;

/// Blocks the calling thread until `input` yields a `c`/`continue` line or
/// runs out. There is deliberately no timeout: this is for a human sitting
/// at the other end.
pub fn pause<R: BufRead, W: Write>(reason: &str, input: R, mut prompt: W) -> io::Result<()> {
    info!("breakpoint: {}", reason);
    write!(prompt, "[{}] paused, enter `c` to continue: ", reason)?;
    prompt.flush()?;

    for line in input.lines() {
        match line?.trim() {
            "c" | "continue" => break,
            _ => {
                write!(prompt, "[{}] still paused: ", reason)?;
                prompt.flush()?;
            }
        }
    }
    info!("resuming after {}", reason);
    Ok(())
}
