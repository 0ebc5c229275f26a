pub mod event_emitter;
