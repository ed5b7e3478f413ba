//! Built-in workloads
//!
//! Small assembly programs that exercise the recorder's main paths: fixnum
//! and float loops, inlined methods and blocks, container fast paths and a
//! loop whose trace aborts on an untraceable native.

use crate::bytecode::{assemble, Program};
use crate::error::{Error, Result};

/// A named demo program
#[derive(Debug, Clone, Copy)]
pub struct Demo {
    pub name: &'static str,
    pub description: &'static str,
    pub source: &'static str,
}

impl Demo {
    pub fn program(&self) -> Result<Program> {
        assemble(self.source)
    }
}

pub const DEMOS: &[Demo] = &[
    Demo {
        name: "counter",
        description: "count to 100000 in a fixnum loop",
        source: COUNTER,
    },
    Demo {
        name: "sqrt_sum",
        description: "sum Math.sqrt(i) as floats",
        source: SQRT_SUM,
    },
    Demo {
        name: "points",
        description: "inlined method calls updating an instance variable",
        source: POINTS,
    },
    Demo {
        name: "yield",
        description: "a method loop yielding to an inlined block",
        source: YIELD,
    },
    Demo {
        name: "strings",
        description: "append to a string with <<",
        source: STRINGS,
    },
    Demo {
        name: "hash",
        description: "hash updates through string-literal keys",
        source: HASH,
    },
    Demo {
        name: "rand",
        description: "a loop calling Kernel#rand, which traces cannot enter",
        source: RAND,
    },
];

/// Look a demo up by name
pub fn find(name: &str) -> Result<&'static Demo> {
    DEMOS.iter().find(|d| d.name == name).ok_or_else(|| {
        let names: Vec<_> = DEMOS.iter().map(|d| d.name).collect();
        Error::config(format!("unknown demo {} (have: {})", name, names.join(", ")))
    })
}

const COUNTER: &str = "
top main locals=1
  putobject 0
  setlocal 0 0
loop:
  getlocal 0 0
  putobject 1
  opt_plus
  setlocal 0 0
  getlocal 0 0
  putobject 100000
  opt_lt
  branchif loop
  getlocal 0 0
  leave
end
";

const SQRT_SUM: &str = "
top main locals=2
  putobject 0.0
  setlocal 0 0
  putobject 0
  setlocal 1 0
loop:
  getlocal 0 0
  getconstant Math
  getlocal 1 0
  send sqrt 1
  opt_plus
  setlocal 0 0
  getlocal 1 0
  opt_succ
  setlocal 1 0
  getlocal 1 0
  putobject 10000
  opt_lt
  branchif loop
  getlocal 0 0
  leave
end
";

const POINTS: &str = "
class Point
  attr_reader x
  def initialize params=1
    getlocal 0
    setinstancevariable @x
    putnil
    leave
  end
  def move params=1
    getinstancevariable @x
    getlocal 0
    opt_plus
    setinstancevariable @x
    putnil
    leave
  end
end
top main locals=2
  getconstant Point
  putobject 0
  send new 1
  setlocal 0 0
  putobject 0
  setlocal 1 0
loop:
  getlocal 0 0
  putobject 2
  send move 1
  pop
  getlocal 1 0
  opt_succ
  setlocal 1 0
  getlocal 1 0
  putobject 1000
  opt_lt
  branchif loop
  getlocal 0 0
  send x 0
  leave
end
";

const YIELD: &str = "
def upto params=1 locals=2
  putobject 0
  setlocal 1 0
loop:
  getlocal 1 0
  invokeblock 1
  pop
  getlocal 1 0
  opt_succ
  setlocal 1 0
  getlocal 1 0
  getlocal 0 0
  opt_lt
  branchif loop
  putnil
  leave
end
block add params=1 locals=1
  getlocal 0 1
  getlocal 0 0
  opt_plus
  setlocal 0 1
  putnil
  leave
end
top main locals=1
  putobject 0
  setlocal 0 0
  putself
  putobject 1000
  send upto 1 &add
  pop
  getlocal 0 0
  leave
end
entry main
";

const STRINGS: &str = r#"
top main locals=2
  putstring ""
  setlocal 0 0
  putobject 0
  setlocal 1 0
loop:
  getlocal 0 0
  putstring "ab"
  opt_ltlt
  pop
  getlocal 1 0
  opt_succ
  setlocal 1 0
  getlocal 1 0
  putobject 500
  opt_lt
  branchif loop
  getlocal 0 0
  opt_length
  leave
end
"#;

const HASH: &str = r#"
top main locals=2
  newhash 0
  setlocal 0 0
  getlocal 0 0
  putobject 0
  opt_aset_with "n"
  pop
  putobject 0
  setlocal 1 0
loop:
  getlocal 0 0
  getlocal 0 0
  opt_aref_with "n"
  putobject 3
  opt_plus
  opt_aset_with "n"
  pop
  getlocal 1 0
  opt_succ
  setlocal 1 0
  getlocal 1 0
  putobject 200
  opt_lt
  branchif loop
  getlocal 0 0
  opt_aref_with "n"
  leave
end
"#;

const RAND: &str = "
top main locals=2
  putobject 0
  setlocal 0 0
  putobject 0
  setlocal 1 0
loop:
  getlocal 0 0
  putself
  putobject 10
  send rand 1 fcall
  opt_plus
  setlocal 0 0
  getlocal 1 0
  opt_succ
  setlocal 1 0
  getlocal 1 0
  putobject 100
  opt_lt
  branchif loop
  getlocal 0 0
  leave
end
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_demo_assembles() {
        for demo in DEMOS {
            demo.program().unwrap_or_else(|e| panic!("{}: {}", demo.name, e));
        }
    }

    #[test]
    fn test_find() {
        assert_eq!(find("counter").unwrap().name, "counter");
        let err = find("nope").unwrap_err().to_string();
        assert!(err.contains("counter"));
    }
}
