pub mod config;
pub mod context;
pub mod listener;
pub mod packet;
pub mod queue;

mod error;
pub use error::{AnyError, AnyResult};

use figlet_rs::FIGfont;

pub fn print_logo() {
    let standard_font = FIGfont::standard().unwrap();
    if let Some(figure) = standard_font.convert("Wiremux") {
        println!("{figure}");
    }
}
