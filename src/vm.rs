//! Máquina virtual de referencia.
//!
//! Ejecuta el texto de ensamblador emitido sobre un modelo abstracto
//! del procesador del pulser: un registro de palabra W con marca de
//! último origen, bandera de comparación, pila de direcciones para
//! `JMPPUSH`/`JMPPOP`, archivo de registros indirecto, doce canales
//! DDS y un contador monotónico de ciclos de reloj. Al arrancar se
//! escanea el programa una vez en busca de etiquetas `NAME:` para
//! construir el índice de saltos.
//!
//! # Temporización
//! Cada instrucción ejecutada avanza el reloj un ciclo. Una escritura
//! DDS programa un temporizador de 64 ciclos que debe agotarse antes
//! de que un `WAITDDSWRITEDONE` posterior complete; ese opcode avanza
//! el reloj por el presupuesto restante. `UPDATE d` avanza el reloj
//! `d` ciclos y consume concurrentemente esa cantidad del temporizador
//! DDS.
//!
//! # Determinismo
//! Las lecturas externas (`READPIPE`, `LDCOUNT`, `RAMREAD`, `RAND`)
//! provienen del modelo de hardware de semilla fija, por lo que la
//! ejecución de un programa dado es completamente reproducible.

use std::collections::HashMap;

use thiserror::Error;

use crate::hardware::FakeHardware;

/// Ciclos máximos antes de declarar al programa colgado.
const CYCLE_LIMIT: u64 = 10_000_000;

/// Ciclos de asentamiento de una escritura de registro DDS.
const DDS_WRITE_CYCLES: u64 = 64;

/// Error de ejecución; incluye la línea de ensamblador ofensora.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum VmError {
    #[error("assembly line {line}: unknown opcode in `{text}`")]
    UnknownOpcode { line: usize, text: String },

    #[error("assembly line {line}: bad operand in `{text}`")]
    BadOperand { line: usize, text: String },

    #[error("assembly line {line}: duplicate label `{label}`")]
    DuplicateLabel { line: usize, label: String },

    #[error("assembly line {line}: jump to undefined label in `{text}`")]
    UndefinedLabel { line: usize, text: String },

    #[error("assembly line {line}: undefined name in `{text}`")]
    UndefinedName { line: usize, text: String },

    #[error("assembly line {line}: return stack underflow")]
    StackUnderflow { line: usize },

    #[error("execution exceeded {0} clock cycles")]
    CycleLimit(u64),
}

/// Resultado de una ejecución completa.
#[derive(Debug)]
pub struct RunReport {
    /// Estado final de todas las variables del encabezado.
    pub variables: HashMap<String, u64>,
    /// Ciclos de reloj transcurridos.
    pub cycles: u64,
    /// Cantidad de escrituras a registros DDS.
    pub dds_writes: u32,
    /// Líneas cuyo efecto fue comprobadamente redundante.
    pub redundant: Vec<(usize, String)>,
    /// Palabras escritas al pipe de salida.
    pub output: Vec<u64>,
}

/// Ejecuta un programa ensamblador completo.
pub fn run(text: &str) -> Result<RunReport, VmError> {
    let program = parse(text)?;
    Machine::new(program).execute()
}

struct Instr {
    label: Option<String>,
    opcode: String,
    operands: Vec<String>,
    file_line: usize,
    text: String,
}

struct ProgramText {
    variables: HashMap<String, u64>,
    body: Vec<Instr>,
    labels: HashMap<String, usize>,
}

/// Escanea el texto: encabezado de declaraciones, índice de etiquetas
/// y cuerpo ejecutable.
fn parse(text: &str) -> Result<ProgramText, VmError> {
    let mut variables = HashMap::new();
    let mut body: Vec<Instr> = Vec::new();
    let mut labels = HashMap::new();

    for (index, raw) in text.lines().enumerate() {
        let file_line = index + 1;

        let cut = match raw.find('#') {
            Some(position) => &raw[..position],
            None => raw,
        };

        let trimmed = cut.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut tokens = trimmed.split_whitespace();
        let first = tokens.next().unwrap_or("");

        if first == "const" || first == "var" {
            let name = tokens.next().ok_or_else(|| VmError::BadOperand {
                line: file_line,
                text: trimmed.to_string(),
            })?;

            let value = tokens.next().ok_or_else(|| VmError::BadOperand {
                line: file_line,
                text: trimmed.to_string(),
            })?;

            let value = parse_word(value.trim_end_matches(',')).ok_or_else(|| {
                VmError::BadOperand {
                    line: file_line,
                    text: trimmed.to_string(),
                }
            })?;

            variables.insert(name.to_string(), value);
            continue;
        }

        // Instrucción, con etiqueta `NAME:` opcional en columna cero
        let (label, rest) = match trimmed.find(':') {
            Some(position)
                if trimmed[..position]
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                    && position > 0 =>
            {
                (
                    Some(trimmed[..position].to_string()),
                    trimmed[position + 1..].trim(),
                )
            }
            _ => (None, trimmed),
        };

        if let Some(label) = &label {
            if labels.insert(label.clone(), body.len()).is_some() {
                return Err(VmError::DuplicateLabel {
                    line: file_line,
                    label: label.clone(),
                });
            }
        }

        let mut parts = rest.split_whitespace();
        let opcode = parts.next().unwrap_or("NOP").to_string();
        let operands: Vec<String> = rest
            .strip_prefix(&opcode)
            .unwrap_or("")
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .map(String::from)
            .collect();

        body.push(Instr {
            label,
            opcode,
            operands,
            file_line,
            text: trimmed.to_string(),
        });
    }

    Ok(ProgramText {
        variables,
        body,
        labels,
    })
}

fn parse_word(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse::<u64>().ok()
    }
}

#[derive(Copy, Clone, Default)]
struct DdsChannel {
    freq: u64,
    phase: u64,
    amp: u64,
}

struct Machine {
    program: ProgramText,
    pc: usize,
    w: u64,
    w_tag: Option<String>,
    cmp: bool,
    stack: Vec<u64>,
    indf: u64,
    indirect: HashMap<u64, u64>,
    ram_address: u64,
    dds: [DdsChannel; 12],
    dds_timer: u64,
    dds_writes: u32,
    shutter_mask: u64,
    shutter: u64,
    counter_mask: u64,
    send_mask: u64,
    trigger: u64,
    sync_time: u64,
    cycles: u64,
    hardware: FakeHardware,
    output: Vec<u64>,
    redundant: Vec<(usize, String)>,
}

impl Machine {
    fn new(program: ProgramText) -> Self {
        Machine {
            program,
            pc: 0,
            w: 0,
            w_tag: None,
            cmp: false,
            stack: Vec::new(),
            indf: 0,
            indirect: HashMap::new(),
            ram_address: 0,
            dds: [DdsChannel::default(); 12],
            dds_timer: 0,
            dds_writes: 0,
            shutter_mask: 0,
            shutter: 0,
            counter_mask: 0,
            send_mask: 0,
            trigger: 0,
            sync_time: 0,
            cycles: 0,
            hardware: FakeHardware::new(),
            output: Vec::new(),
            redundant: Vec::new(),
        }
    }

    fn execute(mut self) -> Result<RunReport, VmError> {
        while self.pc < self.program.body.len() {
            self.cycles += 1;
            if self.cycles > CYCLE_LIMIT {
                return Err(VmError::CycleLimit(CYCLE_LIMIT));
            }

            self.dds_timer = self.dds_timer.saturating_sub(1);

            if self.step()? {
                break;
            }
        }

        Ok(RunReport {
            variables: self.program.variables,
            cycles: self.cycles,
            dds_writes: self.dds_writes,
            redundant: self.redundant,
            output: self.output,
        })
    }

    /// Ejecuta la instrucción actual; retorna `true` en `END`.
    fn step(&mut self) -> Result<bool, VmError> {
        let index = self.pc;
        let line = self.program.body[index].file_line;

        // Una etiqueta es un punto de entrada: la marca de W deja de
        // ser confiable
        if self.program.body[index].label.is_some() {
            self.w_tag = None;
        }

        let opcode = self.program.body[index].opcode.clone();
        let mut next = self.pc + 1;

        match opcode.as_str() {
            "NOP" | "WAIT" | "WAITFORSYNC" => (),

            "LDWR" => {
                let name = self.operand_name(index, 0)?;
                if self.w_tag.as_deref() == Some(name.as_str()) {
                    self.report_redundant(index);
                }

                self.w = self.value_at(index, 0)?;
                self.w_tag = Some(name);
            }

            "STWR" => {
                let name = self.operand_name(index, 0)?;
                if self.program.variables.get(&name) == Some(&self.w) {
                    self.report_redundant(index);
                }

                self.program.variables.insert(name.clone(), self.w);
                self.w_tag = Some(name);
            }

            "STWI" => {
                self.indirect.insert(self.indf, self.w);
            }

            "LDCOUNT" => {
                let channel = self.value_at(index, 0)?;
                self.w = self.hardware.load_count(channel);
                self.w_tag = None;
            }

            "RAMREAD" => {
                self.w = self.hardware.read_ram();
                self.w_tag = None;
            }

            "SETRAMADDR" => {
                self.ram_address = self.value_at(index, 0)?;
            }

            "ADDW" => self.arithmetic(index, |w, v| w.wrapping_add(v))?,
            "SUBW" => self.arithmetic(index, |w, v| w.wrapping_sub(v))?,
            "MULTW" => self.arithmetic(index, |w, v| w.wrapping_mul(v))?,
            "DIVW" => self.arithmetic(index, word_div)?,
            "ANDW" => self.arithmetic(index, |w, v| w & v)?,
            "ORW" => self.arithmetic(index, |w, v| w | v)?,
            "SHL" => self.arithmetic(index, word_shl)?,
            "SHR" => self.arithmetic(index, word_shr)?,

            "INC" => {
                let name = self.operand_name(index, 0)?;
                let value = self.named_value(index, &name)?.wrapping_add(1);
                self.program.variables.insert(name.clone(), value);
                self.w = value;
                self.w_tag = Some(name);
            }

            "DEC" => {
                let name = self.operand_name(index, 0)?;
                let value = self.named_value(index, &name)?.wrapping_sub(1);
                self.program.variables.insert(name.clone(), value);
                self.w = value;
                self.w_tag = Some(name);
            }

            "CMPLESS" => self.compare(index, |w, v| w < v)?,
            "CMPLE" => self.compare(index, |w, v| w <= v)?,
            "CMPGREATER" => self.compare(index, |w, v| w > v)?,
            "CMPGE" => self.compare(index, |w, v| w >= v)?,
            "CMPEQUAL" => self.compare(index, |w, v| w == v)?,
            "CMPNOTEQUAL" => self.compare(index, |w, v| w != v)?,

            "JMP" => next = self.jump_target(index)?,
            "JMPZ" => {
                if self.w == 0 {
                    next = self.jump_target(index)?;
                }
            }
            "JMPNZ" => {
                if self.w != 0 {
                    next = self.jump_target(index)?;
                }
            }
            "JMPCMP" => {
                if self.cmp {
                    next = self.jump_target(index)?;
                }
            }
            "JMPNCMP" => {
                if !self.cmp {
                    next = self.jump_target(index)?;
                }
            }
            "JMPPIPEEMPTY" => {
                if self.hardware.pipe_empty() {
                    next = self.jump_target(index)?;
                }
            }
            "JMPPIPEAVAIL" => {
                if !self.hardware.pipe_empty() {
                    next = self.jump_target(index)?;
                }
            }
            "JMPRAMVALID" => {
                if self.hardware.ram_valid() {
                    next = self.jump_target(index)?;
                }
            }
            "JMPRAMINVALID" => {
                if !self.hardware.ram_valid() {
                    next = self.jump_target(index)?;
                }
            }

            // El modelo no genera interrupciones
            "JMPNINTERRUPT" => next = self.jump_target(index)?,

            "JMPPUSH" => {
                self.stack.push(self.pc as u64 + 1);
                next = self.jump_target(index)?;
            }

            "JMPPOP" => {
                next = self
                    .stack
                    .pop()
                    .ok_or(VmError::StackUnderflow { line })? as usize;
            }

            "PUSH" => {
                let value = self.value_at(index, 0)?;
                self.stack.push(value);
            }

            "POP" => {
                self.w = self.stack.pop().ok_or(VmError::StackUnderflow { line })?;
                self.w_tag = None;
            }

            "READPIPE" => {
                self.w = self.hardware.read_pipe();
                self.w_tag = None;
            }

            "READPIPEINDF" => {
                self.indf = self.hardware.read_pipe();
                let value = self.hardware.read_pipe();
                self.indirect.insert(self.indf, value);
            }

            "WRITEPIPE" => self.output.push(self.w),

            "WRITEPIPEINDF" => {
                let value = self.indirect.get(&self.indf).copied().unwrap_or(0);
                self.output.push(value);
            }

            "WRITERESULTTOPIPE" => {
                let channel = self.value_at(index, 0)?;
                let value = self.value_at(index, 1)?;
                self.output.push(channel);
                self.output.push(value);
            }

            "DDSFRQ" => self.dds_write(index, |channel, value| channel.freq = value)?,
            "DDSPHS" => self.dds_write(index, |channel, value| channel.phase = value)?,
            "DDSAMP" => self.dds_write(index, |channel, value| channel.amp = value)?,

            "WAITDDSWRITEDONE" => {
                self.cycles += self.dds_timer;
                self.dds_timer = 0;
            }

            "UPDATE" => {
                let last = self.program.body[index].operands.len().checked_sub(1);
                let duration = match last {
                    Some(position) => self.value_at(index, position)?,
                    None => {
                        return Err(VmError::BadOperand {
                            line,
                            text: self.program.body[index].text.clone(),
                        })
                    }
                };

                self.cycles += duration;
                self.dds_timer = self.dds_timer.saturating_sub(duration);
            }

            "SHUTTERMASK" => self.shutter_mask = self.value_at(index, 0)?,
            "ASYNCSHUTTER" => self.shutter = self.value_at(index, 0)? & self.shutter_mask,
            "ASYNCINVSHUTTER" => self.shutter = !self.value_at(index, 0)? & self.shutter_mask,
            "COUNTERMASK" => self.counter_mask = self.value_at(index, 0)?,
            "SENDENABLEMASK" => self.send_mask = self.value_at(index, 0)?,
            "TRIGGER" => self.trigger = self.value_at(index, 0)?,
            "SETSYNCTIME" => self.sync_time = self.value_at(index, 0)?,

            "WAITFORTRIGGER" => {
                self.value_at(index, 0)?;
            }

            "RAND" => {
                self.w = self.hardware.rand();
                self.w_tag = None;
            }

            "RANDSEED" => {
                let seed = self.value_at(index, 0)?;
                self.hardware.reseed(seed);
            }

            "DACOUT" | "SERIALWRITE" | "SETPARAMETER" => {
                self.value_at(index, 0)?;
                self.value_at(index, 1)?;
            }

            "END" => return Ok(true),

            _ => {
                return Err(VmError::UnknownOpcode {
                    line,
                    text: self.program.body[index].text.clone(),
                })
            }
        }

        self.pc = next;
        Ok(false)
    }

    fn arithmetic<F>(&mut self, index: usize, op: F) -> Result<(), VmError>
    where
        F: FnOnce(u64, u64) -> u64,
    {
        let value = self.value_at(index, 0)?;
        self.w = op(self.w, value);
        self.w_tag = None;
        Ok(())
    }

    fn compare<F>(&mut self, index: usize, op: F) -> Result<(), VmError>
    where
        F: FnOnce(u64, u64) -> bool,
    {
        let value = self.value_at(index, 0)?;
        self.cmp = op(self.w, value);
        Ok(())
    }

    fn dds_write<F>(&mut self, index: usize, write: F) -> Result<(), VmError>
    where
        F: FnOnce(&mut DdsChannel, u64),
    {
        let channel = self.value_at(index, 0)? as usize;
        let value = self.value_at(index, 1)?;

        if channel >= self.dds.len() {
            return Err(VmError::BadOperand {
                line: self.program.body[index].file_line,
                text: self.program.body[index].text.clone(),
            });
        }

        write(&mut self.dds[channel], value);
        self.dds_timer = DDS_WRITE_CYCLES;
        self.dds_writes += 1;

        Ok(())
    }

    fn operand_name(&self, index: usize, position: usize) -> Result<String, VmError> {
        let instr = &self.program.body[index];
        instr
            .operands
            .get(position)
            .cloned()
            .ok_or_else(|| VmError::BadOperand {
                line: instr.file_line,
                text: instr.text.clone(),
            })
    }

    /// Valor de un operando: variable del encabezado o literal.
    fn value_at(&self, index: usize, position: usize) -> Result<u64, VmError> {
        let name = self.operand_name(index, position)?;
        self.named_value(index, &name)
    }

    fn named_value(&self, index: usize, name: &str) -> Result<u64, VmError> {
        if let Some(value) = self.program.variables.get(name) {
            return Ok(*value);
        }

        parse_word(name).ok_or_else(|| VmError::UndefinedName {
            line: self.program.body[index].file_line,
            text: self.program.body[index].text.clone(),
        })
    }

    fn jump_target(&self, index: usize) -> Result<usize, VmError> {
        let instr = &self.program.body[index];
        let target = instr
            .operands
            .last()
            .ok_or_else(|| VmError::BadOperand {
                line: instr.file_line,
                text: instr.text.clone(),
            })?;

        self.program
            .labels
            .get(target)
            .copied()
            .ok_or_else(|| VmError::UndefinedLabel {
                line: instr.file_line,
                text: instr.text.clone(),
            })
    }

    fn report_redundant(&mut self, index: usize) {
        let instr = &self.program.body[index];
        self.redundant.push((instr.file_line, instr.text.clone()));
    }
}

pub(crate) fn word_div(w: u64, v: u64) -> u64 {
    if v == 0 {
        0
    } else {
        w / v
    }
}

pub(crate) fn word_shl(w: u64, v: u64) -> u64 {
    w.wrapping_shl((v & 63) as u32)
}

pub(crate) fn word_shr(w: u64, v: u64) -> u64 {
    w.wrapping_shr((v & 63) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_a_counting_loop() {
        let program = "\
var k 0
# inline variables
var inlinevar_for_10 10
begin_while_label_1: LDWR k
  CMPLESS inlinevar_for_10
  JMPNCMP end_while_label_1
begin_body_while_label_1: INC k
  JMP begin_while_label_1
end_while_label_1: END
";

        let report = run(program).unwrap();
        assert_eq!(report.variables["k"], 10);
    }

    #[test]
    fn dds_writes_take_their_settling_time() {
        let program = "\
const NULL 0
var f 1234
var ch 0
  DDSFRQ ch, f
  WAITDDSWRITEDONE
  END
";

        let report = run(program).unwrap();
        assert_eq!(report.dds_writes, 1);
        // DDSFRQ (1) + WAITDDSWRITEDONE (1 + 63 restantes) + END (1)
        assert_eq!(report.cycles, 66);
    }

    #[test]
    fn update_consumes_the_dds_timer() {
        let program = "\
const NULL 0
var f 1234
var ch 0
var t 100
  DDSFRQ ch, f
  UPDATE t
  WAITDDSWRITEDONE
  END
";

        let report = run(program).unwrap();
        // El UPDATE de 100 ciclos agota el temporizador DDS: la espera
        // posterior no agrega ciclos extra
        assert_eq!(report.cycles, 1 + (1 + 100) + 1 + 1);
    }

    #[test]
    fn detects_redundant_loads() {
        let program = "\
var x 5
  LDWR x
  LDWR x
  END
";

        let report = run(program).unwrap();
        assert_eq!(report.redundant.len(), 1);
    }

    #[test]
    fn rejects_unknown_opcodes() {
        let program = "  FROB x\n";
        assert!(matches!(
            run(program),
            Err(VmError::UnknownOpcode { line: 1, .. }),
        ));
    }

    #[test]
    fn rejects_duplicate_labels() {
        let program = "\
begin_if_label_1: NOP
begin_if_label_1: NOP
  END
";

        assert!(matches!(run(program), Err(VmError::DuplicateLabel { .. })));
    }

    #[test]
    fn call_and_return_round_trip() {
        let program = "\
var f_x 0
var y 0
var inlinevar_for_7 7
  LDWR inlinevar_for_7
  STWR f_x
  JMPPUSH begin_function_f_label_0
  STWR y
  END
begin_function_f_label_0: LDWR f_x
  JMPPOP
  END
";

        let report = run(program).unwrap();
        assert_eq!(report.variables["y"], 7);
    }
}
