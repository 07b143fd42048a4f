pub mod any_state;
