//! Gapless playback scheduler
//!
//! Synthesized speech arrives as a sequence of short buffers. Each one is
//! started exactly where the previous one ends on the output device clock, so
//! the listener hears one continuous stream. A barge-in interrupt stops every
//! queued unit at once and rewinds the timeline.
//!
//! # Timeline
//!
//! ```text
//! start_at(k)       = max(next_start_time, device_now)
//! next_start_time  := start_at(k) + duration(k)
//! ```
//!
//! # Generations
//!
//! Every interrupt bumps a generation counter. Callers take a [`Ticket`]
//! before decoding a chunk and present it when scheduling; a ticket issued
//! before the most recent interrupt is stale and its buffer is discarded
//! instead of being placed on the rewound timeline. End-of-playback
//! notifications carry the unit's generation too, so late notifications for
//! stopped units are ignored.

use std::collections::HashMap;

use super::pcm::AudioBuffer;
use super::AudioError;

/// Identity of one scheduled playback unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId {
    generation: u64,
    sequence: u64,
}

impl UnitId {
    pub fn new(generation: u64, sequence: u64) -> Self {
        Self {
            generation,
            sequence,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.generation, self.sequence)
    }
}

/// Proof of the scheduler generation observed before decoding began
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    generation: u64,
}

/// Output device as seen by the scheduler
///
/// Implementations report natural end of each unit out-of-band (see
/// [`super::DeviceEvent::UnitEnded`]); units removed through [`stop`] produce
/// no notification.
///
/// [`stop`]: PlaybackDevice::stop
pub trait PlaybackDevice: Send {
    /// Current playback clock in seconds
    fn current_time(&self) -> f64;

    /// Start `buffer` at `start_at` seconds on the device clock
    fn schedule(
        &mut self,
        unit: UnitId,
        buffer: AudioBuffer,
        start_at: f64,
    ) -> Result<(), AudioError>;

    /// Stop a unit immediately, whether or not it has started
    fn stop(&mut self, unit: UnitId);

    /// Release the device. Must be safe to call more than once.
    fn shutdown(&mut self);
}

impl PlaybackDevice for Box<dyn PlaybackDevice> {
    fn current_time(&self) -> f64 {
        (**self).current_time()
    }

    fn schedule(
        &mut self,
        unit: UnitId,
        buffer: AudioBuffer,
        start_at: f64,
    ) -> Result<(), AudioError> {
        (**self).schedule(unit, buffer, start_at)
    }

    fn stop(&mut self, unit: UnitId) {
        (**self).stop(unit)
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}

/// Result of presenting a decoded buffer to the scheduler
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleOutcome {
    /// Buffer was queued on the device
    Scheduled {
        unit: UnitId,
        start_at: f64,
        duration: f64,
    },
    /// Ticket predates the last interrupt; buffer dropped
    Stale,
    /// Zero-length buffer; nothing to play
    Empty,
}

/// Owns the output device, the timeline cursor and the active-unit set
pub struct PlaybackScheduler<D: PlaybackDevice> {
    device: D,
    /// Scheduled start time of the next unit
    next_start_time: f64,
    /// Units started and not yet ended or stopped, with their start times
    active: HashMap<UnitId, f64>,
    generation: u64,
    next_sequence: u64,
    /// Count of units scheduled (for logging)
    units_scheduled: u64,
}

impl<D: PlaybackDevice> PlaybackScheduler<D> {
    /// Wrap an opened device; the timeline starts at the device's current clock
    pub fn new(device: D) -> Self {
        let next_start_time = device.current_time();
        Self {
            device,
            next_start_time,
            active: HashMap::new(),
            generation: 0,
            next_sequence: 0,
            units_scheduled: 0,
        }
    }

    /// Snapshot the current generation before decoding a chunk
    pub fn ticket(&self) -> Ticket {
        Ticket {
            generation: self.generation,
        }
    }

    /// Queue a decoded buffer directly after everything already queued
    pub fn schedule(
        &mut self,
        ticket: Ticket,
        buffer: AudioBuffer,
    ) -> Result<ScheduleOutcome, AudioError> {
        if ticket.generation != self.generation {
            log::debug!(
                "Playback: discarding buffer from generation {} (current {})",
                ticket.generation,
                self.generation
            );
            return Ok(ScheduleOutcome::Stale);
        }
        if buffer.is_empty() {
            return Ok(ScheduleOutcome::Empty);
        }

        let now = self.device.current_time();
        let start_at = self.next_start_time.max(now);
        let duration = buffer.duration();

        let unit = UnitId::new(self.generation, self.next_sequence);
        self.device.schedule(unit, buffer, start_at)?;
        self.next_sequence += 1;

        self.active.insert(unit, start_at);
        self.next_start_time = start_at + duration;
        self.units_scheduled += 1;

        if self.units_scheduled % 50 == 0 {
            log::debug!("Playback: scheduled {} units", self.units_scheduled);
        }

        Ok(ScheduleOutcome::Scheduled {
            unit,
            start_at,
            duration,
        })
    }

    /// Handle a natural end-of-playback notification
    ///
    /// Returns true when this removal drained the active set. Notifications
    /// for unknown or already-stopped units return false.
    pub fn on_unit_ended(&mut self, unit: UnitId) -> bool {
        if self.active.remove(&unit).is_none() {
            log::trace!("Playback: ignoring end of inactive unit {}", unit);
            return false;
        }
        self.active.is_empty()
    }

    /// Barge-in: stop everything, rewind the timeline, invalidate tickets
    ///
    /// Returns the number of units stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for (unit, _) in self.active.drain() {
            self.device.stop(unit);
        }
        self.next_start_time = 0.0;
        self.generation += 1;

        log::info!(
            "Playback: interrupted, {} units stopped (generation {})",
            stopped,
            self.generation
        );
        stopped
    }

    /// True iff at least one unit is queued or playing
    pub fn is_speaking(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Stop all units and release the device
    pub fn shutdown(&mut self) {
        for (unit, _) in self.active.drain() {
            self.device.stop(unit);
        }
        self.next_start_time = 0.0;
        self.generation += 1;
        self.device.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeDevice {
        now: f64,
        scheduled: Vec<(UnitId, f64, f64)>,
        stopped: Vec<UnitId>,
        fail_next: bool,
        shutdowns: usize,
    }

    impl PlaybackDevice for FakeDevice {
        fn current_time(&self) -> f64 {
            self.now
        }

        fn schedule(
            &mut self,
            unit: UnitId,
            buffer: AudioBuffer,
            start_at: f64,
        ) -> Result<(), AudioError> {
            if self.fail_next {
                self.fail_next = false;
                return Err(AudioError::StreamPlayFailed("device lost".to_string()));
            }
            self.scheduled.push((unit, start_at, buffer.duration()));
            Ok(())
        }

        fn stop(&mut self, unit: UnitId) {
            self.stopped.push(unit);
        }

        fn shutdown(&mut self) {
            self.shutdowns += 1;
        }
    }

    fn buffer_ms(ms: usize) -> AudioBuffer {
        AudioBuffer::mono(24000, vec![0.1; 24 * ms])
    }

    fn schedule(sched: &mut PlaybackScheduler<FakeDevice>, ms: usize) -> ScheduleOutcome {
        let ticket = sched.ticket();
        sched.schedule(ticket, buffer_ms(ms)).unwrap()
    }

    fn start_of(outcome: ScheduleOutcome) -> f64 {
        match outcome {
            ScheduleOutcome::Scheduled { start_at, .. } => start_at,
            other => panic!("Expected Scheduled, got {:?}", other),
        }
    }

    #[test]
    fn test_back_to_back_is_gapless() {
        let mut sched = PlaybackScheduler::new(FakeDevice {
            now: 1.5,
            ..Default::default()
        });

        let durations = [100, 40, 250, 10, 60];
        let starts: Vec<f64> = durations
            .iter()
            .map(|&ms| start_of(schedule(&mut sched, ms)))
            .collect();

        let mut expected = starts[0];
        for (k, &ms) in durations.iter().enumerate() {
            assert!((starts[k] - expected).abs() < 1e-9, "unit {} not gapless", k);
            expected += ms as f64 / 1000.0;
        }
        assert_eq!(starts[0], 1.5);
        assert!((sched.next_start_time() - expected).abs() < 1e-9);
        assert_eq!(sched.active_count(), durations.len());
        assert!(sched.is_speaking());
    }

    #[test]
    fn test_falls_behind_then_heals_to_device_clock() {
        let mut sched = PlaybackScheduler::new(FakeDevice::default());
        schedule(&mut sched, 100);

        // Long pause: device clock overtook the cursor
        sched.device_mut().now = 5.0;
        let start = start_of(schedule(&mut sched, 100));
        assert_eq!(start, 5.0);
        assert!((sched.next_start_time() - 5.1).abs() < 1e-9);
    }

    #[test]
    fn test_interrupt_stops_all_and_resets_cursor() {
        let mut sched = PlaybackScheduler::new(FakeDevice {
            now: 2.0,
            ..Default::default()
        });
        schedule(&mut sched, 100);
        schedule(&mut sched, 100);

        let stopped = sched.interrupt();
        assert_eq!(stopped, 2);
        assert_eq!(sched.active_count(), 0);
        assert!(!sched.is_speaking());
        assert_eq!(sched.next_start_time(), 0.0);
        assert_eq!(sched.device().stopped.len(), 2);

        // Next buffer lands at max(0, now), never after the stale cursor
        sched.device_mut().now = 2.05;
        let start = start_of(schedule(&mut sched, 100));
        assert_eq!(start, 2.05);
    }

    #[test]
    fn test_stale_ticket_is_discarded() {
        let mut sched = PlaybackScheduler::new(FakeDevice::default());
        schedule(&mut sched, 100);

        // Decode began before the interrupt landed
        let ticket = sched.ticket();
        sched.interrupt();

        let outcome = sched.schedule(ticket, buffer_ms(100)).unwrap();
        assert_eq!(outcome, ScheduleOutcome::Stale);
        assert_eq!(sched.active_count(), 0);
        assert_eq!(sched.device().scheduled.len(), 1);
    }

    #[test]
    fn test_end_notifications_drain_set() {
        let mut sched = PlaybackScheduler::new(FakeDevice::default());
        let a = match schedule(&mut sched, 50) {
            ScheduleOutcome::Scheduled { unit, .. } => unit,
            _ => unreachable!(),
        };
        let b = match schedule(&mut sched, 50) {
            ScheduleOutcome::Scheduled { unit, .. } => unit,
            _ => unreachable!(),
        };

        assert!(!sched.on_unit_ended(a));
        assert!(sched.is_speaking());
        assert!(sched.on_unit_ended(b));
        assert!(!sched.is_speaking());

        // Duplicate notification is harmless
        assert!(!sched.on_unit_ended(b));
    }

    #[test]
    fn test_late_end_after_interrupt_ignored() {
        let mut sched = PlaybackScheduler::new(FakeDevice::default());
        let old = match schedule(&mut sched, 50) {
            ScheduleOutcome::Scheduled { unit, .. } => unit,
            _ => unreachable!(),
        };
        sched.interrupt();
        schedule(&mut sched, 50);

        assert!(!sched.on_unit_ended(old));
        assert_eq!(sched.active_count(), 1);
    }

    #[test]
    fn test_empty_buffer_not_scheduled() {
        let mut sched = PlaybackScheduler::new(FakeDevice::default());
        let ticket = sched.ticket();
        let outcome = sched
            .schedule(ticket, AudioBuffer::mono(24000, Vec::new()))
            .unwrap();
        assert_eq!(outcome, ScheduleOutcome::Empty);
        assert!(!sched.is_speaking());
    }

    #[test]
    fn test_device_failure_leaves_state_untouched() {
        let mut sched = PlaybackScheduler::new(FakeDevice::default());
        sched.device_mut().fail_next = true;
        let ticket = sched.ticket();
        assert!(sched.schedule(ticket, buffer_ms(100)).is_err());
        assert_eq!(sched.active_count(), 0);
        assert_eq!(sched.next_start_time(), 0.0);
    }

    #[test]
    fn test_unit_ids_are_unique_across_generations() {
        let mut sched = PlaybackScheduler::new(FakeDevice::default());
        schedule(&mut sched, 10);
        sched.interrupt();
        schedule(&mut sched, 10);

        let ids: Vec<UnitId> = sched.device().scheduled.iter().map(|s| s.0).collect();
        assert_ne!(ids[0], ids[1]);
        assert_eq!(ids[1].generation(), 1);
    }

    #[test]
    fn test_shutdown_releases_device() {
        let mut sched = PlaybackScheduler::new(FakeDevice::default());
        schedule(&mut sched, 10);
        sched.shutdown();
        assert!(!sched.is_speaking());
        assert_eq!(sched.device().stopped.len(), 1);
        assert_eq!(sched.device().shutdowns, 1);
    }
}
