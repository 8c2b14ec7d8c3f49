//! Hooks `getpid` and `close` in this process, watches a couple of file
//! descriptors and reports every watched descriptor that gets closed.

use std::{
    fs::File,
    io,
    os::unix::io::AsRawFd,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use libc::{c_int, pid_t};
use log::{debug, info, warn};
use once_cell::sync::{Lazy, OnceCell};
use snare_lib::{
    caller_return_address, current_frame_pointer, AddressClassifier, DynamicSymbols, Hook,
    HookDescriptor, HookRegistry, ImportPatcher, ProcessImage, ReportSink, StackWalker,
    WatchRegistry,
};

use crate::Result;

pub struct Options {
    pub bias: u64,
    pub max_depth: usize,
    pub report_dir: Option<PathBuf>,
    pub pause: bool,
}

struct Diagnostics {
    classifier: AddressClassifier,
    max_depth: usize,
    reports: Option<ReportSink>,
}

static DIAGNOSTICS: OnceCell<Diagnostics> = OnceCell::new();
static WATCHED: Lazy<WatchRegistry<c_int>> = Lazy::new(WatchRegistry::new);
static CLOSED: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(vec![]));
static REPORTS: AtomicUsize = AtomicUsize::new(0);
static GETPID_CALLS: AtomicUsize = AtomicUsize::new(0);

static GETPID: Hook<unsafe extern "C" fn() -> pid_t> = Hook::new();
static CLOSE: Hook<unsafe extern "C" fn(c_int) -> c_int> = Hook::new();

unsafe extern "C" fn getpid_hook() -> pid_t {
    GETPID_CALLS.fetch_add(1, Ordering::SeqCst);
    if let (Some(diagnostics), Some(caller)) = (DIAGNOSTICS.get(), caller_return_address()) {
        debug!("getpid called from {}", diagnostics.classifier.render(caller));
    }
    GETPID.dispatch(|original| original())
}

unsafe extern "C" fn close_hook(fd: c_int) -> c_int {
    // Forget the handle before it goes away, so a recycled descriptor
    // number is never mistaken for the old one.
    if let Some(name) = WATCHED.unwatch(&fd) {
        on_watched_close(fd, &name);
    }
    CLOSE.dispatch(|original| original(fd))
}

fn on_watched_close(fd: c_int, name: &str) {
    info!("closing watched file {} (fd {})", name, fd);
    if let Ok(mut closed) = CLOSED.lock() {
        closed.push(name.to_string());
    }

    let diagnostics = match DIAGNOSTICS.get() {
        Some(diagnostics) => diagnostics,
        None => return,
    };
    let walker = StackWalker::for_current_thread().with_max_depth(diagnostics.max_depth);
    // Safety: the walker is confined to this thread's stack.
    let backtrace = unsafe { walker.walk(current_frame_pointer()) };
    snare_lib::log_backtrace(&diagnostics.classifier, &backtrace);

    if let Some(reports) = &diagnostics.reports {
        let mut buf = format!("close {} fd={}\n", name, fd);
        for address in backtrace.iter().filter(|address| *address != 0) {
            buf.push_str(&format!("{}\n", diagnostics.classifier.render(address)));
        }
        match reports.persist(name, buf.as_bytes()) {
            Ok(_) => {
                REPORTS.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => warn!("failed to write report for {}: {}", name, e),
        }
    }
}

pub fn run(options: Options) -> Result<()> {
    let image = ProcessImage::current()?;
    info!(
        "{} loaded at {:#x}",
        image.path().display(),
        image.load_base()
    );

    let reports = match &options.report_dir {
        Some(dir) => Some(ReportSink::create(dir)?),
        None => None,
    };
    let diagnostics = Diagnostics {
        classifier: AddressClassifier::new(&image).with_display_bias(options.bias),
        max_depth: options.max_depth,
        reports,
    };
    if DIAGNOSTICS.set(diagnostics).is_err() {
        warn!("diagnostics were already configured");
    }

    // Unhooked reference value for the check after installing.
    let pid = std::process::id();

    let registry = HookRegistry::new((DynamicSymbols, &image), ImportPatcher::for_image(&image));
    unsafe { registry.install(&GETPID, &HookDescriptor::symbol("getpid"), getpid_hook) }?;
    println!("hooked getpid");
    unsafe { registry.install(&CLOSE, &HookDescriptor::symbol("close"), close_hook) }?;
    println!("hooked close");

    if options.pause {
        snare_lib::pause("hooks installed", io::stdin().lock(), io::stderr())?;
    }

    let before = GETPID_CALLS.load(Ordering::SeqCst);
    let matches = std::process::id() == pid;
    println!(
        "pid matches: {} (intercepted: {})",
        matches,
        GETPID_CALLS.load(Ordering::SeqCst) > before
    );

    let exe = File::open(image.path())?;
    let maps = File::open("/proc/self/maps")?;
    WATCHED.watch(exe.as_raw_fd(), "exe");
    WATCHED.watch(maps.as_raw_fd(), "maps");

    for (name, file) in [("exe", exe), ("maps", maps)] {
        drop(file);
        let intercepted = CLOSED
            .lock()
            .map(|closed| closed.iter().any(|closed| closed == name))
            .unwrap_or(false);
        println!("closed watched file: {} (intercepted: {})", name, intercepted);
    }
    println!("still watched: {}", WATCHED.len());

    if options.report_dir.is_some() {
        println!("reports written: {}", REPORTS.load(Ordering::SeqCst));
    }

    Ok(())
}
