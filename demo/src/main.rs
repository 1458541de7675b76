//! Demo application.
//!
//! Wires a small task set onto the runtime: a ping/pong pair exchanging
//! messages, and a blinker driven by a repeating software timer and a
//! (simulated) GPIO interrupt. The ping task shuts the whole system down
//! after a fixed number of round trips, so the demo runs, chatters, and
//! exits cleanly.
//!
//! An optional argument names a RON file with a `kern::Config` to use
//! instead of the defaults.

use kern::{
    Board, Config, Error, EventMask, MsgKind, Priority, Runtime, SysState,
    TaskContext, TaskState,
};

/// Round trips before the ping task requests shutdown.
const ROUND_TRIPS: u32 = 20;
/// GPIO the blinker listens on.
const BLINK_GPIO: u8 = 5;
/// Timer id the blinker uses; kept distinct from the GPIO number so the
/// two notification streams are tellable apart.
const BLINK_TIMER: u8 = 7;

/// Minimal `log::Log` writing straight to stderr.
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

/// Board that narrates what real hardware would do.
struct ConsoleBoard;

impl Board for ConsoleBoard {
    fn set_ready(&self, on: bool) {
        log::info!("system-ready -> {}", if on { "high" } else { "low" });
    }

    fn configure_input(&self, gpio: u8, pull_down: bool) {
        log::info!(
            "gpio {} configured as input ({})",
            gpio,
            if pull_down { "pull-down" } else { "pull-up" }
        );
    }
}

fn load_config() -> Config {
    let path = match std::env::args().nth(1) {
        Some(p) => p,
        None => return Config::default(),
    };
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("cannot read {}: {}; using defaults", path, e);
            return Config::default();
        }
    };
    match ron::de::from_str(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("cannot parse {}: {}; using defaults", path, e);
            Config::default()
        }
    }
}

fn ping_task(
    pong: kern::TaskId,
) -> impl FnMut(&TaskContext<'_>) -> Result<(), Error> + Send {
    let mut sent = 0u32;
    let mut done = 0u32;
    move |cx: &TaskContext<'_>| {
        match cx.state() {
            TaskState::INIT => return cx.log_notify("ping: ready"),
            TaskState::STOP => {
                return cx.log_notify(format!(
                    "ping: stopping after {} round trips",
                    done
                ))
            }
            _ => {}
        }
        while let Some(msg) = cx.recv() {
            if cx.answer_ping(&msg)? {
                continue;
            }
            if msg.kind == MsgKind::ECHO && msg.sender == pong {
                done += 1;
                if done == ROUND_TRIPS {
                    cx.log_notify(format!(
                        "ping: {} round trips, requesting stop",
                        done
                    ))?;
                    cx.set_system_state(SysState::Stop)?;
                    return Ok(());
                }
            }
        }
        if sent == done && sent < ROUND_TRIPS {
            sent += 1;
            cx.send(pong, MsgKind::PING, sent, 0)?;
        }
        Ok(())
    }
}

fn pong_task(cx: &TaskContext<'_>) -> Result<(), Error> {
    if cx.state() == TaskState::INIT {
        return cx.log_notify("pong: ready");
    }
    while let Some(msg) = cx.recv() {
        // Both the watchdog's pings and the ping task's ride the same
        // protocol; the echo goes back to whoever asked.
        cx.answer_ping(&msg)?;
    }
    Ok(())
}

fn blinker_task(cx: &TaskContext<'_>) -> Result<(), Error> {
    match cx.state() {
        TaskState::INIT => {
            cx.subscribe_gpio(
                BLINK_GPIO,
                EventMask::EDGE_RISE,
                false,
                2_000,
            )?;
            cx.set_timer(BLINK_TIMER, true, 100)?;
            return Ok(());
        }
        TaskState::STOP => {
            cx.unsubscribe_gpio(BLINK_GPIO)?;
            cx.cancel_timer(BLINK_TIMER)?;
            return Ok(());
        }
        _ => {}
    }
    while let Some(msg) = cx.recv() {
        if cx.answer_ping(&msg)? {
            continue;
        }
        match msg.kind {
            MsgKind(BLINK_TIMER) => {
                let tick = msg.primary;
                cx.log_debug(1, format!("blink (tick {})", tick))?;
            }
            MsgKind(BLINK_GPIO) => {
                cx.log_notify("blinker: edge on the button pin")?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn main() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Info);

    let cfg = load_config();
    let mut rt = match Runtime::new(cfg) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("bring-up failed: {}", e);
            std::process::exit(1);
        }
    };
    rt.set_board(Box::new(ConsoleBoard));

    let result = (|| -> Result<_, Error> {
        let pong = rt.register("pong", Priority::NORMAL, pong_task)?;
        rt.register("ping", Priority::NORMAL, ping_task(pong))?;
        rt.register("blinker", Priority::LOW, blinker_task)?;
        rt.start()
    })();
    let handle = match result {
        Ok(h) => h,
        Err(e) => {
            eprintln!("bring-up failed: {}", e);
            std::process::exit(1);
        }
    };

    // Pretend a button is being pressed while the ping traffic runs.
    let irq = handle.irq();
    for _ in 0..3 {
        std::thread::sleep(std::time::Duration::from_millis(30));
        irq.raise(BLINK_GPIO, EventMask::EDGE_RISE);
    }

    match handle.join() {
        Ok(()) => log::info!("system down, clean"),
        Err(fatal) => {
            eprintln!("system down: {}", fatal);
            std::process::exit(1);
        }
    }
}
