// Copyright 2025 ContactSearch Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Gauge registry for the stats reporter, rendered as Prometheus text.

use std::collections::BTreeMap;
use std::sync::Mutex;

pub struct MetricsRegistry {
    namespace: String,
    deployment: String,
    gauges: Mutex<BTreeMap<String, f64>>,
}

impl MetricsRegistry {
    pub fn new(namespace: &str, deployment: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            deployment: deployment.to_string(),
            gauges: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        let mut gauges = self.gauges.lock().expect("metrics lock poisoned");
        gauges.insert(name.to_string(), value);
    }

    /// Renders every gauge in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let gauges = self.gauges.lock().expect("metrics lock poisoned");
        let mut out = String::new();

        for (name, value) in gauges.iter() {
            let full = format!("{}_{}", self.namespace, name);
            out.push_str(&format!("# TYPE {} gauge\n", full));
            out.push_str(&format!(
                "{}{{deployment=\"{}\"}} {}\n",
                full, self.deployment, value
            ));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_formats_prometheus_text() {
        let metrics = MetricsRegistry::new("contactsearch", "prod");
        metrics.set_gauge("contacts_indexed", 42.0);
        metrics.set_gauge("contacts_rate", 12.5);

        let out = metrics.render();
        assert_eq!(
            out,
            "# TYPE contactsearch_contacts_indexed gauge\n\
             contactsearch_contacts_indexed{deployment=\"prod\"} 42\n\
             # TYPE contactsearch_contacts_rate gauge\n\
             contactsearch_contacts_rate{deployment=\"prod\"} 12.5\n"
        );
    }

    #[test]
    fn set_gauge_overwrites() {
        let metrics = MetricsRegistry::new("ns", "dev");
        metrics.set_gauge("g", 1.0);
        metrics.set_gauge("g", 2.0);
        assert!(metrics.render().contains("ns_g{deployment=\"dev\"} 2\n"));
    }
}
