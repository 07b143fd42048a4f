pub mod basic_funcs;
