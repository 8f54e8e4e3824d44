use std::collections::HashMap;
use log::{debug, error, warn};

use crate::metering_p1::P1Error;
use crate::obis_utils::Obis;

pub type ValueCallback = Box<dyn FnMut(f64)>;
pub type TextCallback = Box<dyn FnMut(&str)>;

struct TextSensor {
    identifier: String,
    callback: TextCallback,
}

/// Consumers of decoded values. Filled once before the reader starts.
pub struct SensorRegistry {
    sensors: HashMap<Obis, ValueCallback>,
    text_sensors: Vec<TextSensor>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        return SensorRegistry {
            sensors: HashMap::new(),
            text_sensors: Vec::new(),
        };
    }

    /// Bind `callback` to an OBIS code given as `A-B:C.D.E` or `C.D.E`.
    pub fn register_sensor<F: FnMut(f64) + 'static>(&mut self, obis_code: &str, callback: F) -> Result<Obis, P1Error> {
        let obis = Obis::parse(obis_code);
        if !obis.is_valid() {
            error!("Not a valid OBIS code: '{}'", obis_code);
            return Err(P1Error::InvalidAddress(obis_code.to_string()));
        }
        if self.sensors.contains_key(&obis) {
            warn!("OBIS code '{}' already has a sensor, ignoring the new one", obis_code);
            return Err(P1Error::DuplicateAddress(obis_code.to_string()));
        }
        debug!("New sensor for {}", obis);
        self.sensors.insert(obis, Box::new(callback));
        return Ok(obis);
    }

    /// Lines starting with `identifier` are passed to `callback` as raw text.
    /// Identifiers are tried in registration order.
    pub fn register_text_sensor<F: FnMut(&str) + 'static>(&mut self, identifier: &str, callback: F) {
        debug!("New text sensor: '{}'", identifier);
        self.text_sensors.push(TextSensor {
            identifier: identifier.to_string(),
            callback: Box::new(callback),
        });
    }

    pub fn publish_value(&mut self, obis: Obis, value: f64) -> bool {
        match self.sensors.get_mut(&obis) {
            Some(callback) => {
                callback(value);
                true
            }
            None => false,
        }
    }

    pub fn publish_text(&mut self, line: &[u8]) -> bool {
        let sensor = self.text_sensors.iter_mut()
            .find(|s| line.starts_with(s.identifier.as_bytes()));
        match sensor {
            Some(sensor) => {
                let text = String::from_utf8_lossy(line);
                (sensor.callback)(&*text);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, obis: Obis) -> bool {
        return self.sensors.contains_key(&obis);
    }

    pub fn len(&self) -> usize {
        return self.sensors.len() + self.text_sensors.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }
}
