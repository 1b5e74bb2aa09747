use std::collections::HashMap;

pub enum GetNextIdResult {
    Existing(u32),
    New(u32),
}

/// Interns string node ids to dense `u32` handles for petgraph views.
#[derive(Debug, Default)]
pub struct IdGen {
    id_to_str: Vec<String>,
    str_to_id: HashMap<String, u32>,
}

impl IdGen {
    pub fn new() -> IdGen {
        IdGen::default()
    }

    pub fn get_next_id(&mut self, key: &str) -> GetNextIdResult {
        match self.str_to_id.get(key) {
            Some(id) => GetNextIdResult::Existing(*id),
            None => {
                let id = u32::try_from(self.id_to_str.len()).expect("node id space exhausted");
                self.str_to_id.insert(key.to_string(), id);
                self.id_to_str.push(key.to_string());
                GetNextIdResult::New(id)
            }
        }
    }

    pub fn get_by_id(&self, id: u32) -> Option<&str> {
        self.id_to_str.get(id as usize).map(String::as_str)
    }

    pub fn get_id(&self, key: &str) -> Option<u32> {
        self.str_to_id.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.id_to_str.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_str.is_empty()
    }
}
