//! PS/2 keyboard driver
//!
//! Scancodes arrive on IRQ1 from port 0x60, are decoded via the
//! `pc_keyboard` crate (ScancodeSet1, US 104-key layout), and decoded
//! ASCII bytes land in a lock-free ring buffer that the console read
//! path and the shell drain.

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use pc_keyboard::{layouts, DecodedKey, HandleControl, KeyCode, Keyboard, ScancodeSet1};
use spin::Mutex;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Bitmask: Shift is held.
pub const MOD_SHIFT: u8 = 0x01;
/// Bitmask: Ctrl is held.
pub const MOD_CTRL: u8 = 0x02;
/// Bitmask: Alt is held.
pub const MOD_ALT: u8 = 0x04;

static MODIFIER_STATE: AtomicU8 = AtomicU8::new(0);

/// Current modifier key bitmask.
pub fn modifiers() -> u8 {
    MODIFIER_STATE.load(Ordering::Relaxed)
}

fn update_modifier(bit: u8, down: bool) {
    if down {
        MODIFIER_STATE.fetch_or(bit, Ordering::Relaxed);
    } else {
        MODIFIER_STATE.fetch_and(!bit, Ordering::Relaxed);
    }
}

/// Ring buffer size for decoded key bytes (must be a power of 2).
const KEY_BUFFER_SIZE: usize = 256;

/// Lock-free single-producer single-consumer ring buffer. The IRQ
/// handler pushes, the console read path pops.
struct KeyBuffer {
    buf: [u8; KEY_BUFFER_SIZE],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl KeyBuffer {
    const fn new() -> Self {
        Self {
            buf: [0; KEY_BUFFER_SIZE],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Push a byte (single producer: the IRQ handler).
    fn push(&mut self, byte: u8) {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) & (KEY_BUFFER_SIZE - 1);
        let tail = self.tail.load(Ordering::Acquire);
        if next == tail {
            return; // Buffer full, drop key
        }
        self.buf[head] = byte;
        self.head.store(next, Ordering::Release);
    }

    /// Pop a byte (single consumer: the console read path).
    fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let byte = self.buf[tail];
        self.tail
            .store((tail + 1) & (KEY_BUFFER_SIZE - 1), Ordering::Release);
        Some(byte)
    }
}

// SAFETY: KeyBuffer uses atomic head/tail synchronization; the producer
// (IRQ1 handler) and consumer (console reader) sides never race on the
// same index.
unsafe impl Send for KeyBuffer {}
unsafe impl Sync for KeyBuffer {}

static mut KEY_BUFFER: KeyBuffer = KeyBuffer::new();

static KEYBOARD: Mutex<Option<Keyboard<layouts::Us104Key, ScancodeSet1>>> = Mutex::new(None);

/// Initialize the PS/2 keyboard decoder.
pub fn init() {
    let kb = Keyboard::new(
        ScancodeSet1::new(),
        layouts::Us104Key,
        HandleControl::MapLettersToUnicode,
    );
    *KEYBOARD.lock() = Some(kb);
    INITIALIZED.store(true, Ordering::Release);
    println!("[KBD] PS/2 keyboard ready");
}

/// Check if the keyboard driver has been initialized.
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Handle a scancode from the keyboard interrupt (vector 33).
///
/// Must not call println! or take any lock shared with the output path.
pub fn handle_scancode(scancode: u8) {
    let mut kb_guard = KEYBOARD.lock();
    if let Some(ref mut keyboard) = *kb_guard {
        if let Ok(Some(key_event)) = keyboard.add_byte(scancode) {
            let code = key_event.code;
            let is_down = key_event.state == pc_keyboard::KeyState::Down;
            match code {
                KeyCode::LShift | KeyCode::RShift => update_modifier(MOD_SHIFT, is_down),
                KeyCode::LControl | KeyCode::RControl => update_modifier(MOD_CTRL, is_down),
                KeyCode::LAlt | KeyCode::RAltGr => update_modifier(MOD_ALT, is_down),
                _ => {}
            }

            if let Some(DecodedKey::Unicode(ch)) = keyboard.process_keyevent(key_event) {
                if ch.is_ascii() {
                    // SAFETY: handle_scancode is the sole producer
                    // (called from IRQ1 with interrupts disabled).
                    #[allow(static_mut_refs)]
                    unsafe {
                        KEY_BUFFER.push(ch as u8);
                    }
                }
            }
        }
    }
}

/// Pop the next decoded key byte, if any.
pub fn pop_key() -> Option<u8> {
    // SAFETY: the consumer side of the SPSC ring only reads `buf` behind
    // the atomic indices.
    #[allow(static_mut_refs)]
    unsafe {
        KEY_BUFFER.pop()
    }
}
