//! Player entity - Created on first roll, looked up by name afterwards

use serde::{Deserialize, Serialize};

use crate::ids::PlayerId;
use crate::value_objects::PlayerName;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub name: PlayerName,
}
