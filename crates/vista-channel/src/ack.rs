//! Ack window — credit-based flow control per channel client.
//!
//! The server announces a generation and a window with SET_ACK. The peer
//! echoes the generation in ACK_SYNC and sends an ACK every `window`
//! messages. Sending stops while more than twice the window is outstanding.
//! Acks counted against an older generation are ignored.

pub const CLIENT_ACK_WINDOW: u32 = 20;

#[derive(Debug, Clone)]
pub struct AckWindow {
    generation: u32,
    client_generation: u32,
    client_window: u32,
    outstanding: u32,
}

impl AckWindow {
    /// A fresh window is closed until `reset` or `start_generation` opens it.
    pub fn new(client_window: u32) -> Self {
        Self {
            generation: 0,
            client_generation: u32::MAX,
            client_window,
            outstanding: u32::MAX,
        }
    }

    pub fn window(&self) -> u32 {
        self.client_window
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    /// Open the window without starting a new generation.
    pub fn reset(&mut self) {
        self.outstanding = 0;
    }

    /// True while sends must wait for an ack.
    pub fn is_waiting(&self) -> bool {
        self.outstanding > self.client_window.saturating_mul(2)
    }

    pub fn on_sent(&mut self) {
        self.outstanding = self.outstanding.saturating_add(1);
    }

    /// Begin a new generation. Returns (generation, window) for SET_ACK.
    pub fn start_generation(&mut self) -> (u32, u32) {
        self.generation = self.generation.wrapping_add(1);
        self.outstanding = 0;
        (self.generation, self.client_window)
    }

    pub fn on_ack_sync(&mut self, generation: u32) {
        self.client_generation = generation;
    }

    /// Returns true if the ack counted and the outstanding count was reset.
    pub fn on_ack(&mut self) -> bool {
        if self.client_generation != self.generation {
            return false;
        }
        self.outstanding = 0;
        true
    }
}
