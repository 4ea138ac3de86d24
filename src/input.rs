/// Joypad buttons. Directions and actions form the two 4-bit groups
/// multiplexed through the P1 register.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Button {
    Right,
    Left,
    Up,
    Down,
    A,
    B,
    Select,
    Start,
}

impl Button {
    /// (is_direction, bit mask within the group)
    fn group_bit(self) -> (bool, u8) {
        match self {
            Button::Right => (true, 0x01),
            Button::Left => (true, 0x02),
            Button::Up => (true, 0x04),
            Button::Down => (true, 0x08),
            Button::A => (false, 0x01),
            Button::B => (false, 0x02),
            Button::Select => (false, 0x04),
            Button::Start => (false, 0x08),
        }
    }
}

/// P1/JOYP register state. Pressed keys read as 0.
pub struct Input {
    /// Select bits 4-5 as written by the program (0 = group selected).
    select: u8,
    directions: u8,
    actions: u8,
}

impl Input {
    pub fn new() -> Self {
        Self { select: 0x30, directions: 0x0F, actions: 0x0F }
    }

    pub fn read(&self) -> u8 {
        let mut val = 0xC0 | self.select | 0x0F;
        if self.select & 0x10 == 0 {
            val &= 0xF0 | self.directions;
        }
        if self.select & 0x20 == 0 {
            val &= 0xF0 | self.actions;
        }
        val
    }

    pub fn write(&mut self, val: u8) {
        self.select = val & 0x30;
    }

    /// Press a button, raising the Joypad interrupt if its group is
    /// currently selected.
    pub fn press(&mut self, button: Button, if_reg: &mut u8) {
        let (direction, bit) = button.group_bit();
        let (group, selected) = if direction {
            (&mut self.directions, self.select & 0x10 == 0)
        } else {
            (&mut self.actions, self.select & 0x20 == 0)
        };
        let was_up = *group & bit != 0;
        *group &= !bit;
        if was_up && selected {
            *if_reg |= 0x10;
        }
    }

    pub fn release(&mut self, button: Button) {
        let (direction, bit) = button.group_bit();
        if direction {
            self.directions |= bit;
        } else {
            self.actions |= bit;
        }
    }
}

impl Default for Input {
    fn default() -> Self {
        Self::new()
    }
}
