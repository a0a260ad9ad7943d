//! # Clock Module
//!
//! Sorgente del tempo "corrente" usata per `date_indexed`, `date_updated` e per
//! il controllo di staleness dei worker. Iniettabile per rendere deterministici
//! i test sulla concorrenza.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
